use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{Config, ReplicationConfig};
use crate::postgres::decoder::{pg_timestamp_to_unix_ms, LogicalMessage, PgOutputDecoder, TupleData};
use crate::postgres::{
    ChangeEvent, ChangeOperation, Lsn, RelationSchema, ReplicationConnection, ReplicationMessage,
    ReplicationStream,
};
use crate::{Error, Result};

/// Receives every row change in stream order.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub heartbeat_interval: Duration,
    pub wait_timeout: Duration,
}

impl From<&ReplicationConfig> for ListenerSettings {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// Consumes a logical replication stream and hands decoded row changes to
/// a [`ChangeHandler`].
///
/// The replay position only moves after a message has been decoded and,
/// for row changes, after the handler returned. A crash before that point
/// replays the message instead of skipping it.
pub struct ReplicationListener<S: ReplicationStream> {
    stream: S,
    handler: Arc<dyn ChangeHandler>,
    settings: ListenerSettings,
    schemas: HashMap<u32, RelationSchema>,
    position: Lsn,
    position_tx: watch::Sender<Lsn>,
    state: ListenerState,
    last_status: Instant,
    applied: u64,
    checkpoint: Option<(CheckpointManager, String)>,
}

impl ReplicationListener<ReplicationConnection> {
    /// Connects, makes sure the slot exists, and starts streaming from the
    /// checkpointed position (or the configured start position).
    pub async fn connect(config: &Config, handler: Arc<dyn ChangeHandler>) -> Result<Self> {
        let replication = &config.replication;
        info!(state = ?ListenerState::Connecting, slot = %replication.slot_name, "Connecting replication listener");

        let checkpoint = replication.checkpoint_file.as_ref().map(CheckpointManager::new);
        let start = match &checkpoint {
            Some(manager) => match manager.load().await? {
                Some(saved) if saved.slot_name == replication.slot_name => Some(saved.lsn),
                Some(saved) => {
                    warn!(saved_slot = %saved.slot_name, "Ignoring checkpoint for a different slot");
                    None
                }
                None => None,
            },
            None => None,
        };
        let start = match (start, &replication.start_lsn) {
            (Some(lsn), _) => lsn,
            (None, Some(configured)) => configured.parse()?,
            (None, None) => Lsn::ZERO,
        };

        let mut connection = ReplicationConnection::new(config).await?;
        connection.identify_system().await?;
        connection.create_replication_slot().await?;
        connection.start_replication(start).await?;

        let mut listener = Self::new(connection, handler, start, ListenerSettings::from(replication));
        if let Some(manager) = checkpoint {
            listener = listener.with_checkpoint(manager, replication.slot_name.clone());
        }
        Ok(listener)
    }
}

impl<S: ReplicationStream> ReplicationListener<S> {
    /// Wraps a stream that is already in streaming mode.
    pub fn new(stream: S, handler: Arc<dyn ChangeHandler>, start: Lsn, settings: ListenerSettings) -> Self {
        let (position_tx, _) = watch::channel(start);
        Self {
            stream,
            handler,
            settings,
            schemas: HashMap::new(),
            position: start,
            position_tx,
            state: ListenerState::Streaming,
            last_status: Instant::now(),
            applied: 0,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, manager: CheckpointManager, slot_name: String) -> Self {
        self.checkpoint = Some((manager, slot_name));
        self
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn position(&self) -> Lsn {
        self.position
    }

    /// Observes every position change.
    pub fn subscribe(&self) -> watch::Receiver<Lsn> {
        self.position_tx.subscribe()
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Runs until `shutdown` fires or the connection fails, then closes.
    ///
    /// A message that was framed correctly but fails to decode is logged and
    /// skipped. Framing and transport errors leave the stream unreadable, so
    /// they stop the listener.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(lsn = %self.position, "Replication listener streaming");

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(()) => {}
                Err(
                    e @ (Error::Connection(_)
                    | Error::Io(_)
                    | Error::PgServer { .. }
                    | Error::Protocol(_)
                    | Error::Replication { .. }),
                ) => {
                    error!("Replication stream failed: {}", e);
                    if let Err(close) = self.close().await {
                        warn!("Error closing replication listener: {}", close);
                    }
                    return Err(e);
                }
                Err(Error::UnknownRelation(relation_id)) => {
                    warn!(relation_id, "Discarding change for unannounced relation");
                }
                Err(e) => warn!("Discarding replication message: {}", e),
            }
        }

        self.close().await
    }

    /// One iteration: heartbeat if due, then wait for and apply one message.
    pub async fn poll_once(&mut self) -> Result<()> {
        if self.last_status.elapsed() >= self.settings.heartbeat_interval {
            self.send_status().await?;
            self.save_checkpoint().await;
        }

        let Some(message) = self.stream.recv(self.settings.wait_timeout).await? else {
            trace!("No replication message within wait timeout");
            return Ok(());
        };

        match message {
            ReplicationMessage::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                trace!(wal_end = %wal_end, reply_requested, "Keepalive");
                if reply_requested {
                    self.send_status().await?;
                }
                Ok(())
            }
            ReplicationMessage::XLogData {
                wal_start,
                timestamp,
                data,
                ..
            } => self.apply(wal_start, timestamp, &data).await,
        }
    }

    #[instrument(skip_all, fields(wal_start = %wal_start))]
    async fn apply(&mut self, wal_start: Lsn, timestamp: i64, data: &[u8]) -> Result<()> {
        let message = PgOutputDecoder::decode(data)?;
        let ts_ms = pg_timestamp_to_unix_ms(timestamp);

        match message {
            LogicalMessage::Relation(schema) => {
                debug!(
                    relation_id = schema.relation_id,
                    table = %format!("{}.{}", schema.namespace, schema.table),
                    columns = schema.columns.len(),
                    "Relation announced"
                );
                self.schemas.insert(schema.relation_id, schema);
            }
            LogicalMessage::Insert { relation_id, new } => {
                self.emit(relation_id, ChangeOperation::Insert, &new, wal_start, ts_ms).await?;
            }
            LogicalMessage::Update { relation_id, new, .. } => {
                self.emit(relation_id, ChangeOperation::Update, &new, wal_start, ts_ms).await?;
            }
            LogicalMessage::Delete { relation_id, old } => {
                self.emit(relation_id, ChangeOperation::Delete, &old, wal_start, ts_ms).await?;
            }
            LogicalMessage::Begin { xid, final_lsn, .. } => {
                trace!(xid, final_lsn = %final_lsn, "BEGIN");
            }
            LogicalMessage::Commit { end_lsn, .. } => {
                trace!(end_lsn = %end_lsn, "COMMIT");
            }
            LogicalMessage::Truncate { relation_ids, .. } => {
                info!(?relation_ids, "TRUNCATE received, not forwarded");
            }
            LogicalMessage::Origin { name, .. } => debug!(origin = %name, "ORIGIN"),
            LogicalMessage::Type { name, .. } => debug!(type_name = %name, "TYPE"),
        }

        self.advance(wal_start.advance(data.len() as u64));
        Ok(())
    }

    async fn emit(
        &mut self,
        relation_id: u32,
        op: ChangeOperation,
        row: &TupleData,
        lsn: Lsn,
        ts_ms: i64,
    ) -> Result<()> {
        let schema = self
            .schemas
            .get(&relation_id)
            .ok_or(Error::UnknownRelation(relation_id))?;

        let event = ChangeEvent {
            schema: schema.namespace.clone(),
            table: schema.table.clone(),
            relation_id,
            op,
            fields: row.to_fields(schema)?,
            lsn,
            ts_ms,
        };

        self.handler.handle(event).await;
        self.applied += 1;
        Ok(())
    }

    fn advance(&mut self, next: Lsn) {
        if next > self.position {
            self.position = next;
            self.position_tx.send_replace(next);
        }
    }

    async fn send_status(&mut self) -> Result<()> {
        self.stream.send_status_update(self.position).await?;
        self.last_status = Instant::now();
        Ok(())
    }

    async fn save_checkpoint(&self) {
        let Some((manager, slot_name)) = &self.checkpoint else {
            return;
        };
        let checkpoint = Checkpoint::new(slot_name.clone(), self.position, self.applied);
        if let Err(e) = manager.save(&checkpoint).await {
            warn!("Failed to save checkpoint: {}", e);
        }
    }

    /// Reports the final position, checkpoints it and closes the stream.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, ListenerState::Closing | ListenerState::Closed) {
            return Ok(());
        }

        self.state = ListenerState::Closing;
        if let Err(e) = self.send_status().await {
            debug!("Final status update not sent: {}", e);
        }
        self.save_checkpoint().await;

        let result = self.stream.close().await;
        self.state = ListenerState::Closed;
        info!(lsn = %self.position, applied = self.applied, "Replication listener closed");
        result
    }
}
