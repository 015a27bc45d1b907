use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::cache::DedupCache;
use super::claim::{claim, Claimed};
use super::store::GraphStore;
use super::types::{pair_key, title_key, Pair, Title};
use crate::crawler::{FetchResult, TitleQuery};
use crate::{Error, Result};

/// Lookups spent waiting for a claimed title's row before the claim is
/// treated as abandoned.
const VISIBILITY_CHECKS: u32 = 6;
const VISIBILITY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct IngestStats {
    pub titles_created: AtomicU64,
    pub pairs_created: AtomicU64,
    pub link_failures: AtomicU64,
    pub frontier_lost: AtomicU64,
}

/// Turns fetched link pages into title and pair rows.
///
/// Every row goes through [`claim`], so any number of builders may ingest
/// overlapping pages concurrently. Titles seen for the first time are pushed
/// back onto the crawl frontier.
///
/// A claim becomes visible before its row does, so a pair may name a title
/// another builder is still inserting. Such pairs wait for the row and, if
/// it never shows up, reclaim the title.
pub struct GraphBuilder {
    store: Arc<dyn GraphStore>,
    cache: Arc<dyn DedupCache>,
    frontier: mpsc::Sender<TitleQuery>,
    enqueue_timeout: Duration,
    stats: Arc<IngestStats>,
}

impl GraphBuilder {
    pub fn new(
        store: Arc<dyn GraphStore>,
        cache: Arc<dyn DedupCache>,
        frontier: mpsc::Sender<TitleQuery>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            frontier,
            enqueue_timeout,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Persists every article link of `result`. Returns the number of links
    /// ingested; failed links are logged and skipped.
    #[instrument(skip_all, fields(title = %result.source.title))]
    pub async fn ingest(&self, result: FetchResult) -> Result<usize> {
        let source = match result.source.id {
            Some(id) => id,
            None => self.persisted_title(&result.source.title).await?.id(),
        };

        let mut ingested = 0;
        for page in result.response.pages.values() {
            for link in page.article_links() {
                match self.ingest_link(source, &link.title).await {
                    Ok(()) => ingested += 1,
                    Err(e) => {
                        self.stats.link_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(dest = %link.title, "Skipping link: {}", e);
                    }
                }
            }
        }

        debug!(ingested, "Page ingested");
        Ok(ingested)
    }

    async fn ingest_link(&self, source: Uuid, dest_name: &str) -> Result<()> {
        let dest = self.resolve_title(dest_name).await?;
        self.enqueue_created(dest_name, dest).await;

        match self.resolve_pair(source, dest.id()).await {
            Err(e) if e.is_missing_reference() => {
                debug!(dest = dest_name, "Destination row not visible yet");
                let dest = self.persisted_title(dest_name).await?;
                self.enqueue_created(dest_name, dest).await;
                self.resolve_pair(source, dest.id()).await?;
            }
            result => {
                result?;
            }
        }
        Ok(())
    }

    /// Resolves `name` to a title whose row is known to exist. A claim held
    /// by another builder is polled with a doubling backoff; one whose row
    /// never appears is released and claimed again.
    async fn persisted_title(&self, name: &str) -> Result<Claimed> {
        let claimed = self.resolve_title(name).await?;
        if claimed.is_created() {
            return Ok(claimed);
        }

        for check in 0..VISIBILITY_CHECKS {
            if let Some(title) = self.store.find_title(name).await? {
                return Ok(Claimed::Existing(title.id));
            }
            tokio::time::sleep(VISIBILITY_BACKOFF * 2u32.pow(check)).await;
        }

        warn!(title = name, stale_id = %claimed.id(), "Claimed title was never stored, reclaiming");
        self.cache.delete(&title_key(name)).await?;
        self.resolve_title(name).await
    }

    pub async fn resolve_title(&self, name: &str) -> Result<Claimed> {
        let key = title_key(name);
        let claimed = claim(self.cache.as_ref(), &key, |id| {
            let title = Title::new(id, name);
            async move { self.store.insert_title(&title).await }
        })
        .await;

        match claimed {
            Ok(claimed) => {
                if claimed.is_created() {
                    self.stats.titles_created.fetch_add(1, Ordering::Relaxed);
                }
                Ok(claimed)
            }
            // Row persisted by an earlier run whose cache entries are gone.
            Err(e) if e.is_duplicate() => {
                let existing = self.store.find_title(name).await?.ok_or_else(|| Error::InvalidMessage {
                    message: format!("title {:?} rejected as duplicate but not found", name),
                })?;
                self.warm(&key, existing.id).await;
                Ok(Claimed::Existing(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn resolve_pair(&self, source: Uuid, dest: Uuid) -> Result<Claimed> {
        let key = pair_key(source, dest);
        let claimed = claim(self.cache.as_ref(), &key, |id| {
            let pair = Pair::new(id, source, dest);
            async move { self.store.insert_pair(&pair).await }
        })
        .await;

        match claimed {
            Ok(claimed) => {
                if claimed.is_created() {
                    self.stats.pairs_created.fetch_add(1, Ordering::Relaxed);
                }
                Ok(claimed)
            }
            Err(e) if e.is_duplicate() => {
                let existing = self
                    .store
                    .find_pair(source, dest)
                    .await?
                    .ok_or_else(|| Error::InvalidMessage {
                        message: format!("pair {} -> {} rejected as duplicate but not found", source, dest),
                    })?;
                self.warm(&key, existing.id).await;
                Ok(Claimed::Existing(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    async fn warm(&self, key: &str, id: Uuid) {
        if let Err(e) = self.cache.set_if_absent(key, &id.to_string()).await {
            debug!(key, "Failed to re-cache existing row: {}", e);
        }
    }

    async fn enqueue_created(&self, name: &str, claimed: Claimed) {
        if let Claimed::Created(id) = claimed {
            self.enqueue(TitleQuery::with_id(name, id)).await;
        }
    }

    async fn enqueue(&self, query: TitleQuery) {
        match self.frontier.send_timeout(query, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(query)) => {
                self.stats.frontier_lost.fetch_add(1, Ordering::Relaxed);
                warn!(title = %query.title, "Query queue full, title will not be crawled");
            }
            Err(SendTimeoutError::Closed(query)) => {
                self.stats.frontier_lost.fetch_add(1, Ordering::Relaxed);
                debug!(title = %query.title, "Query queue closed");
            }
        }
    }
}
