use std::time::Duration;
use tempfile::TempDir;
use wikigraph_cdc::checkpoint::{Checkpoint, CheckpointManager};
use wikigraph_cdc::postgres::Lsn;

#[tokio::test]
async fn test_checkpoint_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("test_checkpoint.json");

    let manager = CheckpointManager::new(&checkpoint_path);

    let checkpoint = Checkpoint::new("wikidb_slot", "1234/5678ABCD".parse().unwrap(), 1000);
    manager.save(&checkpoint).await.unwrap();

    let loaded = manager.load().await.unwrap().expect("Checkpoint should exist");
    assert_eq!(loaded.lsn.to_string(), "1234/5678ABCD");
    assert_eq!(loaded.message_count, 1000);

    let checkpoint2 = Checkpoint::new("wikidb_slot", "2345/6789BCDE".parse().unwrap(), 2000);
    manager.save(&checkpoint2).await.unwrap();

    let loaded2 = manager.load().await.unwrap().expect("Checkpoint should exist");
    assert_eq!(loaded2.lsn, Lsn(0x2345_6789_BCDE));
    assert_eq!(loaded2.message_count, 2000);
}

#[tokio::test]
async fn test_checkpoint_recovery_simulation() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("recovery_checkpoint.json");

    // First run
    {
        let manager = CheckpointManager::new(&checkpoint_path);
        assert!(manager.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new("wikidb_slot", "AAAA/BBBBCCCC".parse().unwrap(), 500);
        manager.save(&checkpoint).await.unwrap();
    }

    // Restart
    {
        let manager = CheckpointManager::new(&checkpoint_path);
        let loaded = manager.load().await.unwrap().expect("Should recover checkpoint");
        assert_eq!(loaded.slot_name, "wikidb_slot");
        assert_eq!(loaded.lsn.to_string(), "AAAA/BBBBCCCC");
        assert_eq!(loaded.message_count, 500);

        let resumed = Checkpoint::new(
            loaded.slot_name.clone(),
            loaded.lsn.advance(0x100),
            loaded.message_count + 300,
        );
        manager.save(&resumed).await.unwrap();
    }

    let manager = CheckpointManager::new(&checkpoint_path);
    let final_checkpoint = manager.load().await.unwrap().expect("Should have final checkpoint");
    assert_eq!(final_checkpoint.lsn.to_string(), "AAAA/BBBBCDCC");
    assert_eq!(final_checkpoint.message_count, 800);
}

#[tokio::test]
async fn test_rapid_checkpoint_writes() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("rapid_checkpoint.json");

    let manager = CheckpointManager::new(&checkpoint_path);

    for i in 0..10u64 {
        let lsn = Lsn((i << 32) | (i * 1000));
        manager.save(&Checkpoint::new("wikidb_slot", lsn, i * 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_checkpoint = manager.load().await.unwrap().expect("Should have checkpoint");
    assert_eq!(final_checkpoint.lsn.to_string(), "9/2328");
    assert_eq!(final_checkpoint.message_count, 900);
}

#[tokio::test]
async fn test_checkpoint_file_is_json() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("checkpoint.json");

    CheckpointManager::new(&checkpoint_path)
        .save(&Checkpoint::new("wikidb_slot", Lsn(0x16_B374_D848), 42))
        .await
        .unwrap();

    let raw = tokio::fs::read_to_string(&checkpoint_path).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["slot_name"], "wikidb_slot");
    assert_eq!(value["lsn"], "16/B374D848");
    assert_eq!(value["message_count"], 42);
}
