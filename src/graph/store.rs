use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::types::{Pair, Title, PAIRS_TABLE, TITLES_TABLE};
use crate::{Error, Result};

/// Persistence for graph rows.
///
/// Inserts must fail with [`Error::Duplicate`] when a uniqueness constraint
/// rejects the row, and with [`Error::MissingReference`] when a pair names a
/// title that is not stored, so callers can tell a lost race from a broken
/// store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn insert_title(&self, title: &Title) -> Result<()>;

    async fn insert_pair(&self, pair: &Pair) -> Result<()>;

    async fn find_title(&self, name: &str) -> Result<Option<Title>>;

    async fn find_pair(&self, source: Uuid, dest: Uuid) -> Result<Option<Pair>>;
}

#[derive(Default)]
struct Tables {
    titles: HashMap<Uuid, Title>,
    title_names: HashMap<String, Uuid>,
    pairs: HashMap<Uuid, Pair>,
    pair_ends: HashMap<(Uuid, Uuid), Uuid>,
}

/// In-memory store with the same constraints as the relational schema:
/// unique title names, unique `(source, dest)` pairs, and pair ends that
/// must reference existing titles.
#[derive(Default)]
pub struct MemoryGraphStore {
    tables: Mutex<Tables>,
    fail_next_inserts: AtomicUsize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` inserts fail with a connection error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_next_inserts.store(n, Ordering::SeqCst);
    }

    pub fn title_count(&self) -> usize {
        self.lock().titles.len()
    }

    pub fn pair_count(&self) -> usize {
        self.lock().pairs.len()
    }

    pub fn titles(&self) -> Vec<Title> {
        self.lock().titles.values().cloned().collect()
    }

    pub fn pairs(&self) -> Vec<Pair> {
        self.lock().pairs.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected_failure(&self) -> Result<()> {
        let injected = self
            .fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(Error::Connection("injected insert failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn insert_title(&self, title: &Title) -> Result<()> {
        self.injected_failure()?;
        let mut tables = self.lock();

        if tables.titles.contains_key(&title.id) || tables.title_names.contains_key(&title.name) {
            return Err(Error::Duplicate {
                table: TITLES_TABLE.to_string(),
                detail: format!("Key (name)=({}) already exists.", title.name),
            });
        }

        tables.title_names.insert(title.name.clone(), title.id);
        tables.titles.insert(title.id, title.clone());
        Ok(())
    }

    async fn insert_pair(&self, pair: &Pair) -> Result<()> {
        self.injected_failure()?;
        let mut tables = self.lock();

        for end in [pair.source, pair.dest] {
            if !tables.titles.contains_key(&end) {
                return Err(Error::MissingReference {
                    table: PAIRS_TABLE.to_string(),
                    detail: format!("Key (title_id)=({}) is not present in table \"titles\".", end),
                });
            }
        }
        if tables.pairs.contains_key(&pair.id) || tables.pair_ends.contains_key(&(pair.source, pair.dest)) {
            return Err(Error::Duplicate {
                table: PAIRS_TABLE.to_string(),
                detail: format!(
                    "Key (title_src, title_dst)=({}, {}) already exists.",
                    pair.source, pair.dest
                ),
            });
        }

        tables.pair_ends.insert((pair.source, pair.dest), pair.id);
        tables.pairs.insert(pair.id, pair.clone());
        Ok(())
    }

    async fn find_title(&self, name: &str) -> Result<Option<Title>> {
        let tables = self.lock();
        Ok(tables
            .title_names
            .get(name)
            .and_then(|id| tables.titles.get(id))
            .cloned())
    }

    async fn find_pair(&self, source: Uuid, dest: Uuid) -> Result<Option<Pair>> {
        let tables = self.lock();
        Ok(tables
            .pair_ends
            .get(&(source, dest))
            .and_then(|id| tables.pairs.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unique_title_name() {
        let store = MemoryGraphStore::new();
        store.insert_title(&Title::new(Uuid::new_v4(), "Huế")).await.unwrap();

        let err = store
            .insert_title(&Title::new(Uuid::new_v4(), "Huế"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.title_count(), 1);
    }

    #[tokio::test]
    async fn test_pair_requires_existing_titles() {
        let store = MemoryGraphStore::new();
        let a = Title::new(Uuid::new_v4(), "A");
        store.insert_title(&a).await.unwrap();

        let dangling = Pair::new(Uuid::new_v4(), a.id, Uuid::new_v4());
        assert!(store.insert_pair(&dangling).await.unwrap_err().is_missing_reference());
        assert_eq!(store.pair_count(), 0);
    }

    #[tokio::test]
    async fn test_unique_pair_and_lookup() {
        let store = MemoryGraphStore::new();
        let a = Title::new(Uuid::new_v4(), "A");
        let b = Title::new(Uuid::new_v4(), "B");
        store.insert_title(&a).await.unwrap();
        store.insert_title(&b).await.unwrap();

        let pair = Pair::new(Uuid::new_v4(), a.id, b.id);
        store.insert_pair(&pair).await.unwrap();
        let again = Pair::new(Uuid::new_v4(), a.id, b.id);
        assert!(store.insert_pair(&again).await.unwrap_err().is_duplicate());

        // Direction matters.
        store.insert_pair(&Pair::new(Uuid::new_v4(), b.id, a.id)).await.unwrap();

        assert_eq!(store.find_pair(a.id, b.id).await.unwrap().unwrap().id, pair.id);
        assert_eq!(store.find_title("B").await.unwrap().unwrap().id, b.id);
        assert!(store.find_title("C").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryGraphStore::new();
        store.fail_next_inserts(1);
        assert!(store.insert_title(&Title::new(Uuid::new_v4(), "A")).await.is_err());
        assert!(store.insert_title(&Title::new(Uuid::new_v4(), "A")).await.is_ok());
    }
}
