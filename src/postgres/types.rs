use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Position in the write-ahead log. Displayed and parsed in PostgreSQL's
/// `XXXXXXXX/XXXXXXXX` form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidMessage {
            message: format!("Invalid LSN: {:?}", s),
        };
        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

/// Column layout of a table as announced on the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    pub relation_id: u32,
    pub namespace: String,
    pub table: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnSchema>,
}

impl RelationSchema {
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One row change. `fields` holds the text form of each column; `None`
/// is SQL NULL (or an unchanged TOAST value the server did not resend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub relation_id: u32,
    pub op: ChangeOperation,
    pub fields: BTreeMap<String, Option<String>>,
    pub lsn: Lsn,
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display_and_parse() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_ordering_and_serde() {
        assert!(Lsn(0x1_0000_0000) > Lsn(0xFFFF_FFFF));
        assert_eq!(Lsn(10).advance(5), Lsn(15));

        let json = serde_json::to_string(&Lsn(0x1_0000_00FF)).unwrap();
        assert_eq!(json, "\"1/FF\"");
        assert_eq!(serde_json::from_str::<Lsn>(&json).unwrap(), Lsn(0x1_0000_00FF));
    }

    #[test]
    fn test_change_event_serializes_operation_uppercase() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Some("Huế".to_string()));
        fields.insert("updated_at".to_string(), None);
        let event = ChangeEvent {
            schema: "public".to_string(),
            table: "titles".to_string(),
            relation_id: 16384,
            op: ChangeOperation::Insert,
            fields,
            lsn: Lsn(42),
            ts_ms: 0,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "INSERT");
        assert_eq!(json["fields"]["name"], "Huế");
        assert!(json["fields"]["updated_at"].is_null());
        assert_eq!(json["lsn"], "0/2A");
    }
}
