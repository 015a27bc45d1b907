use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::fetcher::FetchClient;
use super::types::{FetchResult, TitleQuery};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct CrawlStats {
    pub titles_crawled: AtomicU64,
    pub titles_failed: AtomicU64,
    pub pages_emitted: AtomicU64,
}

/// Pulls titles off the query queue and walks each one through every page
/// of its link listing, emitting one [`FetchResult`] per page.
pub struct CrawlOrchestrator {
    fetcher: Arc<FetchClient>,
    queries: Arc<Mutex<mpsc::Receiver<TitleQuery>>>,
    results: mpsc::Sender<FetchResult>,
    stats: Arc<CrawlStats>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CrawlOrchestrator {
    pub fn new(
        fetcher: Arc<FetchClient>,
        queries: mpsc::Receiver<TitleQuery>,
        results: mpsc::Sender<FetchResult>,
    ) -> Self {
        Self {
            fetcher,
            queries: Arc::new(Mutex::new(queries)),
            results,
            stats: Arc::new(CrawlStats::default()),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.shutdown = CancellationToken::new();
        let pager = self.pager();
        let queries = self.queries.clone();
        self.handle = Some(tokio::spawn(async move {
            run(pager, queries).await;
        }));
        info!("Crawl orchestrator started");
    }

    /// Waits for the title currently being paged to reach a page boundary.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shutdown.cancel();
        if let Err(e) = handle.await {
            warn!("Crawl loop terminated abnormally: {}", e);
        }
        info!("Crawl orchestrator stopped");
    }

    /// Crawls a single title outside the run loop. Returns the number of
    /// pages emitted.
    pub async fn crawl_title(&self, query: TitleQuery) -> Result<usize> {
        self.pager().crawl(query).await
    }

    fn pager(&self) -> Pager {
        Pager {
            fetcher: self.fetcher.clone(),
            results: self.results.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[derive(Clone)]
struct Pager {
    fetcher: Arc<FetchClient>,
    results: mpsc::Sender<FetchResult>,
    stats: Arc<CrawlStats>,
    shutdown: CancellationToken,
}

impl Pager {
    #[instrument(skip(self), fields(title = %query.title))]
    async fn crawl(&self, query: TitleQuery) -> Result<usize> {
        let mut continuation: Option<String> = None;
        let mut pages = 0;

        loop {
            let response = self
                .fetcher
                .fetch_links(&query.title, continuation.as_deref())
                .await?;
            let next = response.continuation_token.clone();

            let result = FetchResult {
                source: query.clone(),
                response,
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
                sent = self.results.send(result) => {
                    sent.map_err(|_| Error::QueueClosed("results"))?;
                }
            }
            pages += 1;
            self.stats.pages_emitted.fetch_add(1, Ordering::Relaxed);

            match next {
                Some(token) if !self.shutdown.is_cancelled() => {
                    debug!(page = pages, "Following continuation");
                    continuation = Some(token);
                }
                Some(_) => return Err(Error::Shutdown),
                None => return Ok(pages),
            }
        }
    }
}

async fn run(pager: Pager, queries: Arc<Mutex<mpsc::Receiver<TitleQuery>>>) {
    let mut queries = queries.lock().await;

    loop {
        let query = tokio::select! {
            _ = pager.shutdown.cancelled() => break,
            next = queries.recv() => match next {
                Some(query) => query,
                None => {
                    info!("Query queue closed");
                    break;
                }
            },
        };

        let title = query.title.clone();
        match pager.crawl(query).await {
            Ok(pages) => {
                pager.stats.titles_crawled.fetch_add(1, Ordering::Relaxed);
                debug!(title = %title, pages, "Title crawled");
            }
            Err(Error::Shutdown) => break,
            Err(Error::QueueClosed(queue)) => {
                warn!(queue, "Downstream queue closed, stopping crawl loop");
                break;
            }
            Err(e) => {
                pager.stats.titles_failed.fetch_add(1, Ordering::Relaxed);
                warn!(title = %title, "Abandoning title: {}", e);
            }
        }
    }

    debug!("Crawl loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::tests::{client, Scripted, ScriptedTransport};
    use std::time::Duration;

    const PAGE_A: &str = r#"{"continue": {"plcontinue": "A"}, "query": {"pages": {"1": {"ns": 0, "title": "Hà Nội", "links": [{"ns": 0, "title": "Việt Nam"}]}}}}"#;
    const PAGE_B: &str = r#"{"continue": {"plcontinue": "B"}, "query": {"pages": {"1": {"ns": 0, "title": "Hà Nội", "links": [{"ns": 0, "title": "Huế"}]}}}}"#;
    const PAGE_LAST: &str = r#"{"continue": {"plcontinue": ""}, "query": {"pages": {"1": {"ns": 0, "title": "Hà Nội", "links": [{"ns": 0, "title": "Sài Gòn"}]}}}}"#;

    fn orchestrator(
        transport: Arc<ScriptedTransport>,
    ) -> (
        CrawlOrchestrator,
        mpsc::Sender<TitleQuery>,
        mpsc::Receiver<FetchResult>,
    ) {
        let (query_tx, query_rx) = mpsc::channel(8);
        let (result_tx, result_rx) = mpsc::channel(8);
        let fetcher = Arc::new(client(transport));
        (CrawlOrchestrator::new(fetcher, query_rx, result_tx), query_tx, result_rx)
    }

    #[tokio::test]
    async fn test_pagination_emits_one_result_per_page() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Json(PAGE_A),
            Scripted::Json(PAGE_B),
            Scripted::Json(PAGE_LAST),
        ]);
        let (orchestrator, _queries, mut results) = orchestrator(transport.clone());

        let pages = orchestrator.crawl_title(TitleQuery::new("Hà Nội")).await.unwrap();
        assert_eq!(pages, 3);

        let mut tokens = Vec::new();
        while let Ok(result) = results.try_recv() {
            assert_eq!(result.source.title, "Hà Nội");
            tokens.push(result.response.continuation_token);
        }
        assert_eq!(tokens, vec![Some("A".to_string()), Some("B".to_string()), None]);

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let token_of = |i: usize| {
            calls[i]
                .1
                .query_pairs()
                .find(|(k, _)| k == "plcontinue")
                .map(|(_, v)| v.into_owned())
        };
        assert_eq!(token_of(0), None);
        assert_eq!(token_of(1).as_deref(), Some("A"));
        assert_eq!(token_of(2).as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_failed_title_is_abandoned_and_loop_continues() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Status(404),
            Scripted::Json(PAGE_LAST),
        ]);
        let (mut orchestrator, queries, mut results) = orchestrator(transport);
        orchestrator.start();

        queries.send(TitleQuery::new("Missing")).await.unwrap();
        queries.send(TitleQuery::new("Hà Nội")).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.source.title, "Hà Nội");

        orchestrator.stop().await;
        let stats = orchestrator.stats();
        assert_eq!(stats.titles_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.titles_crawled.load(Ordering::Relaxed), 1);
        assert_eq!(stats.pages_emitted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let transport = ScriptedTransport::new(vec![]);
        let (mut orchestrator, _queries, _results) = orchestrator(transport.clone());
        orchestrator.start();
        assert!(orchestrator.is_running());

        tokio::time::timeout(Duration::from_secs(1), orchestrator.stop())
            .await
            .unwrap();
        assert!(!orchestrator.is_running());
        assert_eq!(transport.call_count(), 0);
    }
}
