//! Idempotent construction of the title/pair graph from fetched link pages.

pub mod cache;
pub mod claim;
pub mod engine;
pub mod ingest;
pub mod store;
pub mod types;

pub use cache::{DedupCache, MemoryCache, RedisCache};
pub use claim::{claim, Claimed};
pub use engine::IngestionEngine;
pub use ingest::{GraphBuilder, IngestStats};
pub use store::{GraphStore, MemoryGraphStore};
pub use types::{pair_key, title_key, Pair, Title, PAIRS_TABLE, TITLES_TABLE};
