mod common;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wikigraph_cdc::cdc::{ChangeEventRouter, ChangeHandler, ReplicationListener};
use wikigraph_cdc::config::{Config, KafkaConfig};
use wikigraph_cdc::graph::{GraphStore, Pair, Title};
use wikigraph_cdc::kafka::{EventPublisher, KafkaProducer, TopicManager};
use wikigraph_cdc::postgres::{ChangeEvent, ChangeOperation, Lsn, PgStore, ReplicationConnection};

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<ChangeEvent>>,
}

#[async_trait]
impl ChangeHandler for Collector {
    async fn handle(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn setup_publication(config: &Config) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(&config.postgres_url(), NoTls)
        .await
        .expect("Failed to connect to PostgreSQL");
    tokio::spawn(async move {
        let _ = connection.await;
    });

    client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {name}; CREATE PUBLICATION {name} FOR TABLE titles, pairs;",
            name = config.replication.publication
        ))
        .await
        .expect("Failed to create publication");
    client
}

async fn cleanup(config: &Config, client: &tokio_postgres::Client) {
    if let Ok(mut connection) = ReplicationConnection::new(config).await {
        let _ = connection.drop_replication_slot().await;
    }
    let _ = client
        .batch_execute(&format!("DROP PUBLICATION IF EXISTS {}", config.replication.publication))
        .await;
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_listener_streams_graph_inserts() {
    tracing_subscriber::fmt()
        .with_env_filter("wikigraph_cdc=debug")
        .try_init()
        .ok();

    let config = common::get_test_config();
    let store = PgStore::connect(&config).await.unwrap();
    store.ensure_schema().await.unwrap();
    let client = setup_publication(&config).await;

    let collector = Arc::new(Collector::default());
    let mut listener = ReplicationListener::connect(&config, collector.clone()).await.unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        listener.run(token).await.unwrap();
        listener.position()
    });

    let suffix = Uuid::new_v4().simple().to_string();
    let source = Title::new(Uuid::new_v4(), format!("Hà Nội {}", suffix));
    let dest = Title::new(Uuid::new_v4(), format!("Huế {}", suffix));
    store.insert_title(&source).await.unwrap();
    store.insert_title(&dest).await.unwrap();
    store.insert_pair(&Pair::new(Uuid::new_v4(), source.id, dest.id)).await.unwrap();

    let received = timeout(Duration::from_secs(15), async {
        loop {
            if collector.events.lock().unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    shutdown.cancel();
    let position = handle.await.unwrap();
    cleanup(&config, &client).await;

    assert!(received.is_ok(), "timed out waiting for change events");
    let events = collector.events.lock().unwrap();
    assert!(events.iter().all(|event| event.op == ChangeOperation::Insert));
    assert_eq!(events[0].table, "titles");
    assert_eq!(events[0].fields["name"].as_deref(), Some(source.name.as_str()));
    assert_eq!(events[2].table, "pairs");
    assert_eq!(
        events[2].fields["title_src"].as_deref(),
        Some(source.id.to_string().as_str())
    );
    assert!(events.windows(2).all(|w| w[0].lsn < w[1].lsn));
    assert!(position > events[2].lsn);
    assert!(position > Lsn::ZERO);
}

fn create_test_consumer(kafka: &KafkaConfig, topic: &str) -> StreamConsumer {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", kafka.brokers.join(","))
        .set("group.id", format!("test_consumer_{}", std::process::id()))
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .create()
        .expect("Failed to create consumer");

    consumer.subscribe(&[topic]).expect("Failed to subscribe to topic");
    consumer
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_router_delivers_to_kafka() {
    let config = common::get_test_config();
    let topic = config.kafka_topic_name("titles");
    TopicManager::new(&config.kafka)
        .unwrap()
        .ensure_topics(&[topic.clone()])
        .await
        .unwrap();

    let producer: Arc<dyn EventPublisher> = Arc::new(KafkaProducer::open(&config.kafka, topic.clone()).unwrap());
    let mut router = ChangeEventRouter::new();
    router.add_route("titles", producer, Some("title_id".to_string()));

    let title_id = Uuid::new_v4().to_string();
    let mut fields = BTreeMap::new();
    fields.insert("title_id".to_string(), Some(title_id.clone()));
    fields.insert("name".to_string(), Some("Đà Lạt".to_string()));
    let event = ChangeEvent {
        schema: "public".to_string(),
        table: "titles".to_string(),
        relation_id: 16384,
        op: ChangeOperation::Insert,
        fields,
        lsn: Lsn(0x100),
        ts_ms: 0,
    };
    router.route(&event).await.unwrap().expect("titles is routed");
    router.close_all().await;

    let consumer = create_test_consumer(&config.kafka, &topic);
    let message = timeout(Duration::from_secs(10), consumer.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();

    assert_eq!(message.key(), Some(title_id.as_bytes()));
    let json: Value = serde_json::from_slice(message.payload().unwrap()).unwrap();
    assert_eq!(json["table"], "titles");
    assert_eq!(json["op"], "INSERT");
    assert_eq!(json["fields"]["name"], "Đà Lạt");
}
