use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::protocol::{ConnectParams, WireConnection};
use super::types::Lsn;
use crate::config::Config;
use crate::{Error, Result};

/// SQLSTATE `duplicate_object`, returned when the slot already exists.
const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE `undefined_object`.
const UNDEFINED_OBJECT: &str = "42704";

/// Seconds between the Unix epoch and 2000-01-01.
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Messages the server sends inside the CopyBoth stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        timestamp: i64,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty CopyData payload".to_string(),
            });
        }

        match payload.get_u8() {
            b'w' => {
                if payload.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "Truncated XLogData header".to_string(),
                    });
                }
                Ok(ReplicationMessage::XLogData {
                    wal_start: Lsn(payload.get_u64()),
                    wal_end: Lsn(payload.get_u64()),
                    timestamp: payload.get_i64(),
                    data: payload,
                })
            }
            b'k' => {
                if payload.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "Truncated keepalive".to_string(),
                    });
                }
                Ok(ReplicationMessage::Keepalive {
                    wal_end: Lsn(payload.get_u64()),
                    timestamp: payload.get_i64(),
                    reply_requested: payload.get_u8() != 0,
                })
            }
            other => Err(Error::InvalidMessage {
                message: format!("Unknown replication message {:?}", other as char),
            }),
        }
    }
}

/// Standby status update reporting `lsn` as written, flushed and applied.
pub fn encode_standby_status(lsn: Lsn, now: SystemTime, reply_requested: bool) -> Bytes {
    let micros = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .saturating_sub(Duration::from_secs(PG_EPOCH_OFFSET_SECS))
        .as_micros() as i64;

    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_i64(micros);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// The streaming half of a replication session.
#[async_trait]
pub trait ReplicationStream: Send {
    /// Waits at most `wait` for the next message. `Ok(None)` on timeout.
    async fn recv(&mut self, wait: Duration) -> Result<Option<ReplicationMessage>>;

    async fn send_status_update(&mut self, lsn: Lsn) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

pub struct ReplicationConnection {
    wire: WireConnection,
    slot_name: String,
    publication_name: String,
    streaming: bool,
    closed: bool,
}

impl ReplicationConnection {
    pub async fn new(config: &Config) -> Result<Self> {
        let params = ConnectParams {
            host: config.postgres.host.clone(),
            port: config.postgres.port,
            user: config.replication.username.clone(),
            password: config.replication.password.clone(),
            database: config.postgres.database.clone(),
            connect_timeout: Duration::from_secs(config.postgres.connect_timeout_secs),
        };
        info!(slot = %config.replication.slot_name, "Creating replication connection to PostgreSQL");

        Ok(Self {
            wire: WireConnection::connect_replication(&params).await?,
            slot_name: config.replication.slot_name.clone(),
            publication_name: config.replication.publication.clone(),
            streaming: false,
            closed: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn streaming_over(wire: WireConnection) -> Self {
        Self {
            wire,
            slot_name: "test_slot".to_string(),
            publication_name: "test_pub".to_string(),
            streaming: true,
            closed: false,
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        let result = self.wire.simple_query("IDENTIFY_SYSTEM").await?;

        let system_id = result
            .get(0, "systemid")
            .ok_or_else(|| Error::Replication {
                message: "IDENTIFY_SYSTEM returned no rows".to_string(),
            })?
            .to_string();
        let timeline = result
            .get(0, "timeline")
            .and_then(|t| t.parse().ok())
            .unwrap_or(1);
        let xlogpos = result.get(0, "xlogpos").unwrap_or("0/0").parse()?;
        let dbname = result.get(0, "dbname").map(str::to_string);

        let info = SystemInfo {
            system_id,
            timeline,
            xlogpos,
            dbname,
        };
        info!(
            system_id = %info.system_id,
            timeline = info.timeline,
            xlogpos = %info.xlogpos,
            "Identified system"
        );
        Ok(info)
    }

    /// Creates the logical slot, treating "already exists" as success.
    pub async fn create_replication_slot(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            quote_ident(&self.slot_name)
        );

        match self.wire.simple_query(&sql).await {
            Ok(result) => {
                info!(
                    slot = %self.slot_name,
                    consistent_point = result.get(0, "consistent_point").unwrap_or("unknown"),
                    "Created replication slot"
                );
                Ok(())
            }
            Err(e) if slot_exists(&e) => {
                info!(slot = %self.slot_name, "Replication slot already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_replication_slot(&mut self) -> Result<()> {
        let sql = format!("DROP_REPLICATION_SLOT {}", quote_ident(&self.slot_name));

        match self.wire.simple_query(&sql).await {
            Ok(_) => {
                info!(slot = %self.slot_name, "Dropped replication slot");
                Ok(())
            }
            Err(e) if e.sql_state() == Some(UNDEFINED_OBJECT) => {
                warn!(slot = %self.slot_name, "Replication slot does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn start_replication(&mut self, start: Lsn) -> Result<()> {
        let sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            quote_ident(&self.slot_name),
            start,
            self.publication_name.replace('\'', "''")
        );

        self.wire.start_copy_both(&sql).await?;
        self.streaming = true;
        info!(slot = %self.slot_name, lsn = %start, "Replication streaming started");
        Ok(())
    }
}

#[async_trait]
impl ReplicationStream for ReplicationConnection {
    async fn recv(&mut self, wait: Duration) -> Result<Option<ReplicationMessage>> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        match tokio::time::timeout(wait, self.wire.recv_copy_data()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(payload))) => ReplicationMessage::parse(payload).map(Some),
            Ok(Ok(None)) => {
                self.streaming = false;
                Err(Error::Connection("Server ended the replication stream".to_string()))
            }
            Ok(Err(e)) => Err(e),
        }
    }

    async fn send_status_update(&mut self, lsn: Lsn) -> Result<()> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        debug!(lsn = %lsn, "Sending standby status update");
        let payload = encode_standby_status(lsn, SystemTime::now(), false);
        self.wire.send_copy_data(&payload).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.streaming = false;
        info!("Closing replication connection");
        self.wire.terminate().await
    }
}

fn slot_exists(e: &Error) -> bool {
    e.sql_state() == Some(DUPLICATE_OBJECT) || e.to_string().contains("already exists")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlogdata() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x100);
        buf.put_u64(0x200);
        buf.put_i64(7);
        buf.put_slice(b"BODY");

        match ReplicationMessage::parse(buf.freeze()).unwrap() {
            ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                data,
                ..
            } => {
                assert_eq!(wal_start, Lsn(0x100));
                assert_eq!(wal_end, Lsn(0x200));
                assert_eq!(&data[..], b"BODY");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x300);
        buf.put_i64(0);
        buf.put_u8(1);

        assert_eq!(
            ReplicationMessage::parse(buf.freeze()).unwrap(),
            ReplicationMessage::Keepalive {
                wal_end: Lsn(0x300),
                timestamp: 0,
                reply_requested: true
            }
        );
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        assert!(ReplicationMessage::parse(Bytes::from_static(b"k\0\0")).is_err());
        assert!(ReplicationMessage::parse(Bytes::from_static(b"x")).is_err());
        assert!(ReplicationMessage::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_encode_standby_status() {
        let now = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS + 1);
        let mut payload = encode_standby_status(Lsn(0xABCD), now, true);

        assert_eq!(payload.len(), 34);
        assert_eq!(payload.get_u8(), b'r');
        assert_eq!(payload.get_u64(), 0xABCD);
        assert_eq!(payload.get_u64(), 0xABCD);
        assert_eq!(payload.get_u64(), 0xABCD);
        assert_eq!(payload.get_i64(), 1_000_000);
        assert_eq!(payload.get_u8(), 1);
    }

    #[test]
    fn test_slot_exists_detection() {
        let err = Error::PgServer {
            code: DUPLICATE_OBJECT.to_string(),
            message: "replication slot \"s\" already exists".to_string(),
        };
        assert!(slot_exists(&err));
        assert!(!slot_exists(&Error::Connection("refused".to_string())));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("wikidb_slot"), "\"wikidb_slot\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
