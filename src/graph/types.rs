use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TITLES_TABLE: &str = "titles";
pub const PAIRS_TABLE: &str = "pairs";

/// A graph node: one article name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Title {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A directed link from `source` to `dest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub id: Uuid,
    pub source: Uuid,
    pub dest: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pair {
    pub fn new(id: Uuid, source: Uuid, dest: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            source,
            dest,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn title_key(name: &str) -> String {
    format!("title:{}", name)
}

pub fn pair_key(source: Uuid, dest: Uuid) -> String {
    format!("pair:{}:{}", source, dest)
}
