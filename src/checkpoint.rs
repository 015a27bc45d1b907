//! Durable storage for the replication replay position.
//!
//! The listener saves a checkpoint at every heartbeat and when it closes,
//! and resumes from the saved position on the next connect.
//!
//! # Example
//!
//! ```rust,no_run
//! use wikigraph_cdc::checkpoint::{Checkpoint, CheckpointManager};
//! use wikigraph_cdc::postgres::Lsn;
//!
//! # async fn example() -> wikigraph_cdc::Result<()> {
//! let manager = CheckpointManager::new("checkpoint.json");
//!
//! if let Some(checkpoint) = manager.load().await? {
//!     println!("Resuming from LSN: {}", checkpoint.lsn);
//! }
//!
//! manager.save(&Checkpoint::new("wikidb_slot", Lsn(0x1234_5678), 100)).await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::postgres::Lsn;
use crate::{Error, Result};

/// Last replay position confirmed for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Slot the position belongs to
    pub slot_name: String,
    /// Position just past the last applied change
    pub lsn: Lsn,
    /// When the checkpoint was taken
    pub timestamp: DateTime<Utc>,
    /// Changes applied since the listener started
    pub message_count: u64,
}

impl Checkpoint {
    pub fn new(slot_name: impl Into<String>, lsn: Lsn, message_count: u64) -> Self {
        Self {
            slot_name: slot_name.into(),
            lsn,
            timestamp: Utc::now(),
            message_count,
        }
    }
}

/// Reads and atomically replaces a JSON checkpoint file.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    /// Returns `None` when no checkpoint has been written yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.file_path, "No checkpoint file found");
                return Ok(None);
            }
            Err(e) => {
                error!(path = ?self.file_path, "Failed to read checkpoint file: {}", e);
                return Err(Error::Io(e));
            }
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            error!(path = ?self.file_path, "Failed to parse checkpoint file: {}", e);
            Error::Config(format!("Invalid checkpoint file {:?}: {}", self.file_path, e))
        })?;

        info!(
            slot = %checkpoint.slot_name,
            lsn = %checkpoint.lsn,
            timestamp = %checkpoint.timestamp,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Writes to a temporary file, syncs it, then renames it over the
    /// checkpoint so a crash never leaves a partial file behind.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(lsn = %checkpoint.lsn, "Saving checkpoint");

        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.file_path).await?;

        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.file_path).await {
            Ok(()) => {
                info!(path = ?self.file_path, "Deleted checkpoint file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
