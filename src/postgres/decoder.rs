//! Decoder for the `pgoutput` logical replication format (protocol version 1).
//!
//! The decoder is stateless: it turns the payload of one XLogData message
//! into a [`LogicalMessage`]. Tracking relation schemas is left to the
//! caller, which owns the only cache that needs them.

use bytes::{Buf, Bytes};
use std::collections::BTreeMap;
use tracing::trace;

use super::types::{ColumnSchema, Lsn, RelationSchema};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01, PostgreSQL's epoch.
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

pub fn pg_timestamp_to_unix_ms(pg_micros: i64) -> i64 {
    pg_micros.saturating_add(PG_EPOCH_OFFSET_MICROS) / 1000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value that did not change and was not sent.
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}

impl TupleValue {
    pub fn as_text(&self) -> Option<String> {
        match self {
            TupleValue::Text(bytes) | TupleValue::Binary(bytes) => {
                Some(String::from_utf8_lossy(bytes).into_owned())
            }
            TupleValue::Null | TupleValue::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData(pub Vec<TupleValue>);

impl TupleData {
    /// Pairs each value with its column name from `schema`.
    pub fn to_fields(&self, schema: &RelationSchema) -> Result<BTreeMap<String, Option<String>>> {
        if self.0.len() != schema.columns.len() {
            return Err(Error::InvalidMessage {
                message: format!(
                    "Column count mismatch for {}.{}: row has {}, schema has {}",
                    schema.namespace,
                    schema.table,
                    self.0.len(),
                    schema.columns.len()
                ),
            });
        }

        Ok(schema
            .columns
            .iter()
            .zip(&self.0)
            .map(|(column, value)| (column.name.clone(), value.as_text()))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: i64,
    },
    Origin {
        lsn: Lsn,
        name: String,
    },
    Relation(RelationSchema),
    Type {
        type_id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        new: TupleData,
    },
    Update {
        relation_id: u32,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_id: u32,
        old: TupleData,
    },
    Truncate {
        options: u8,
        relation_ids: Vec<u32>,
    },
}

pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn decode(data: &[u8]) -> Result<LogicalMessage> {
        let mut reader = Reader::new(data);
        let tag = reader.u8()?;

        let message = match tag {
            b'B' => LogicalMessage::Begin {
                final_lsn: Lsn(reader.u64()?),
                timestamp: reader.i64()?,
                xid: reader.u32()?,
            },
            b'C' => LogicalMessage::Commit {
                flags: reader.u8()?,
                commit_lsn: Lsn(reader.u64()?),
                end_lsn: Lsn(reader.u64()?),
                timestamp: reader.i64()?,
            },
            b'O' => LogicalMessage::Origin {
                lsn: Lsn(reader.u64()?),
                name: reader.cstr()?,
            },
            b'R' => LogicalMessage::Relation(decode_relation(&mut reader)?),
            b'Y' => LogicalMessage::Type {
                type_id: reader.u32()?,
                namespace: reader.cstr()?,
                name: reader.cstr()?,
            },
            b'I' => {
                let relation_id = reader.u32()?;
                reader.expect_tag(b'N', "INSERT")?;
                LogicalMessage::Insert {
                    relation_id,
                    new: decode_tuple(&mut reader)?,
                }
            }
            b'U' => {
                let relation_id = reader.u32()?;
                let mut old = None;
                let mut kind = reader.u8()?;
                if kind == b'K' || kind == b'O' {
                    old = Some(decode_tuple(&mut reader)?);
                    kind = reader.u8()?;
                }
                if kind != b'N' {
                    return Err(Error::InvalidMessage {
                        message: format!("Unexpected tuple kind {:?} in UPDATE", kind as char),
                    });
                }
                LogicalMessage::Update {
                    relation_id,
                    old,
                    new: decode_tuple(&mut reader)?,
                }
            }
            b'D' => {
                let relation_id = reader.u32()?;
                let kind = reader.u8()?;
                if kind != b'K' && kind != b'O' {
                    return Err(Error::InvalidMessage {
                        message: format!("Unexpected tuple kind {:?} in DELETE", kind as char),
                    });
                }
                LogicalMessage::Delete {
                    relation_id,
                    old: decode_tuple(&mut reader)?,
                }
            }
            b'T' => {
                let count = reader.u32()?;
                let options = reader.u8()?;
                let relation_ids = (0..count).map(|_| reader.u32()).collect::<Result<Vec<_>>>()?;
                LogicalMessage::Truncate {
                    options,
                    relation_ids,
                }
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown pgoutput message type {:?}", other as char),
                })
            }
        };

        trace!(tag = %(tag as char), "Decoded pgoutput message");
        Ok(message)
    }
}

fn decode_relation(reader: &mut Reader<'_>) -> Result<RelationSchema> {
    let relation_id = reader.u32()?;
    let namespace = reader.cstr()?;
    let table = reader.cstr()?;
    let replica_identity = reader.u8()?;
    let count = reader.u16()?;

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = reader.u8()?;
        columns.push(ColumnSchema {
            name: reader.cstr()?,
            type_id: reader.u32()?,
            type_modifier: reader.i32()?,
            is_key: flags & 1 != 0,
        });
    }

    Ok(RelationSchema {
        relation_id,
        namespace,
        table,
        replica_identity,
        columns,
    })
}

fn decode_tuple(reader: &mut Reader<'_>) -> Result<TupleData> {
    let count = reader.u16()?;
    let mut values = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let value = match reader.u8()? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => TupleValue::Text(reader.sized()?),
            b'b' => TupleValue::Binary(reader.sized()?),
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column kind {:?}", other as char),
                })
            }
        };
        values.push(value);
    }

    Ok(TupleData(values))
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::InvalidMessage {
                message: format!(
                    "Truncated message reading {}: need {} bytes, have {}",
                    what,
                    n,
                    self.buf.remaining()
                ),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    fn cstr(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidMessage {
                message: "Unterminated string".to_string(),
            })?;
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(value)
    }

    fn sized(&mut self) -> Result<Bytes> {
        let len = self.i32()?;
        let len = usize::try_from(len).map_err(|_| Error::InvalidMessage {
            message: format!("Negative value length {}", len),
        })?;
        self.need(len, "column value")?;
        let value = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(value)
    }

    fn expect_tag(&mut self, tag: u8, context: &str) -> Result<()> {
        let got = self.u8()?;
        if got != tag {
            return Err(Error::InvalidMessage {
                message: format!(
                    "Unexpected tuple kind {:?} in {}, expected {:?}",
                    got as char, context, tag as char
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    pub(crate) fn relation_message(relation_id: u32, table: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(relation_id);
        buf.put_slice(b"public\0");
        buf.put_slice(table.as_bytes());
        buf.put_u8(0);
        buf.put_u8(b'd');
        buf.put_u16(columns.len() as u16);
        for (name, type_id, is_key) in columns {
            buf.put_u8(u8::from(*is_key));
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(*type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub(crate) fn put_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(v) => {
                    buf.put_u8(b't');
                    buf.put_i32(v.len() as i32);
                    buf.put_slice(v.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
    }

    pub(crate) fn insert_message(relation_id: u32, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    pub(crate) fn begin_message(final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(0);
        buf.put_u32(xid);
        buf.freeze()
    }

    #[test]
    fn test_decode_relation() {
        let data = relation_message(
            16384,
            "titles",
            &[("title_id", 2950, true), ("name", 1043, false)],
        );
        let LogicalMessage::Relation(schema) = PgOutputDecoder::decode(&data).unwrap() else {
            panic!("expected relation");
        };

        assert_eq!(schema.relation_id, 16384);
        assert_eq!(schema.namespace, "public");
        assert_eq!(schema.table, "titles");
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[1].name, "name");
        assert_eq!(schema.columns[1].type_id, 1043);
        let keys: Vec<_> = schema.key_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(keys, vec!["title_id"]);
    }

    #[test]
    fn test_decode_insert_and_zip_fields() {
        let schema = match PgOutputDecoder::decode(&relation_message(
            1,
            "titles",
            &[("title_id", 2950, true), ("name", 1043, false), ("updated_at", 1184, false)],
        ))
        .unwrap()
        {
            LogicalMessage::Relation(schema) => schema,
            other => panic!("unexpected {:?}", other),
        };

        let message = PgOutputDecoder::decode(&insert_message(1, &[Some("abc"), Some("Hà Nội"), None])).unwrap();
        let LogicalMessage::Insert { relation_id, new } = message else {
            panic!("expected insert");
        };
        assert_eq!(relation_id, 1);

        let fields = new.to_fields(&schema).unwrap();
        assert_eq!(fields["name"].as_deref(), Some("Hà Nội"));
        assert_eq!(fields["updated_at"], None);
    }

    #[test]
    fn test_decode_update_with_old_key() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(7);
        buf.put_u8(b'K');
        put_tuple(&mut buf, &[Some("1"), None]);
        buf.put_u8(b'N');
        put_tuple(&mut buf, &[Some("1"), Some("after")]);

        let LogicalMessage::Update { relation_id, old, new } = PgOutputDecoder::decode(&buf).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(relation_id, 7);
        assert_eq!(old.unwrap().0[1], TupleValue::Null);
        assert_eq!(new.0[1], TupleValue::Text(Bytes::from_static(b"after")));
    }

    #[test]
    fn test_decode_delete_and_unchanged_toast() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(7);
        buf.put_u8(b'O');
        buf.put_u16(2);
        buf.put_u8(b't');
        buf.put_i32(1);
        buf.put_u8(b'1');
        buf.put_u8(b'u');

        let LogicalMessage::Delete { old, .. } = PgOutputDecoder::decode(&buf).unwrap() else {
            panic!("expected delete");
        };
        assert_eq!(old.0[1], TupleValue::Unchanged);
        assert_eq!(old.0[1].as_text(), None);
    }

    #[test]
    fn test_decode_transaction_framing() {
        assert_eq!(
            PgOutputDecoder::decode(&begin_message(0x100, 42)).unwrap(),
            LogicalMessage::Begin {
                final_lsn: Lsn(0x100),
                timestamp: 0,
                xid: 42
            }
        );

        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(0x100);
        buf.put_u64(0x130);
        buf.put_i64(1_000_000);
        let LogicalMessage::Commit { end_lsn, .. } = PgOutputDecoder::decode(&buf).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(end_lsn, Lsn(0x130));

        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(2);
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u32(2);
        assert!(matches!(
            PgOutputDecoder::decode(&buf).unwrap(),
            LogicalMessage::Truncate { ref relation_ids, .. } if relation_ids == &vec![1, 2]
        ));
    }

    #[test]
    fn test_truncated_and_unknown_messages_are_errors() {
        let full = insert_message(1, &[Some("abcdef")]);
        let truncated = &full[..full.len() - 3];
        assert!(matches!(
            PgOutputDecoder::decode(truncated),
            Err(Error::InvalidMessage { .. })
        ));
        assert!(PgOutputDecoder::decode(b"Z").is_err());
        assert!(PgOutputDecoder::decode(b"").is_err());
    }

    #[test]
    fn test_column_count_mismatch() {
        let LogicalMessage::Relation(schema) =
            PgOutputDecoder::decode(&relation_message(1, "t", &[("a", 25, true)])).unwrap()
        else {
            panic!("expected relation");
        };
        let row = TupleData(vec![TupleValue::Null, TupleValue::Null]);
        assert!(row.to_fields(&schema).is_err());
    }

    #[test]
    fn test_pg_timestamp_conversion() {
        assert_eq!(pg_timestamp_to_unix_ms(0), 946_684_800_000);
        assert_eq!(pg_timestamp_to_unix_ms(1_500), 946_684_800_001);
        assert_eq!(pg_timestamp_to_unix_ms(i64::MAX), i64::MAX / 1000);
    }
}
