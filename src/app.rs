use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cdc::{ChangeEventRouter, ReplicationListener};
use crate::config::{CacheConfig, Config};
use crate::crawler::{CrawlOrchestrator, FetchClient, LinkApi, ReqwestTransport, TitleQuery};
use crate::graph::{DedupCache, GraphBuilder, IngestionEngine, MemoryCache, RedisCache};
use crate::kafka::{EventPublisher, KafkaProducer, TopicManager};
use crate::postgres::schema::graph_schemas;
use crate::postgres::PgStore;
use crate::seed::load_seeds;
use crate::Result;

/// Owns every long-running component and brings them up and down in order.
pub struct App {
    config: Config,
    router: Arc<ChangeEventRouter>,
    orchestrator: CrawlOrchestrator,
    engine: IngestionEngine,
    frontier: mpsc::Sender<TitleQuery>,
    listener: Option<(CancellationToken, JoinHandle<()>)>,
    seeding: Option<(CancellationToken, JoinHandle<()>)>,
}

impl App {
    /// Connects to the database, bootstraps the graph tables and builds the
    /// crawl, ingestion and routing components. Nothing runs until
    /// [`App::start`].
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(PgStore::connect(&config).await?);
        store.ensure_schema().await?;

        let cache: Arc<dyn DedupCache> = match &config.cache {
            CacheConfig::Memory => {
                info!("Using in-process deduplication cache");
                Arc::new(MemoryCache::new())
            }
            CacheConfig::Redis { url } => Arc::new(RedisCache::connect(url).await?),
        };

        let (frontier, queries) = mpsc::channel(config.crawler.query_queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(config.crawler.results_queue_capacity);

        let transport = Arc::new(ReqwestTransport::new(&config.crawler)?);
        let api = LinkApi::new(&config.crawler.api_base_url)?;
        let fetcher = Arc::new(FetchClient::new(transport, api, &config.crawler));
        let orchestrator = CrawlOrchestrator::new(fetcher, queries, results_tx);

        let builder = Arc::new(GraphBuilder::new(
            store,
            cache,
            frontier.clone(),
            config.ingestion.enqueue_timeout(),
        ));
        let engine = IngestionEngine::new(builder, results_rx, &config.ingestion);

        let router = Arc::new(build_router(&config).await?);

        Ok(Self {
            config,
            router,
            orchestrator,
            engine,
            frontier,
            listener: None,
            seeding: None,
        })
    }

    pub fn router(&self) -> Arc<ChangeEventRouter> {
        self.router.clone()
    }

    /// Starts the replication listener, the crawl pipeline and the ingestion
    /// engine, in that order, then feeds the seed titles. A listener that
    /// fails to connect aborts the start.
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            let mut listener = ReplicationListener::connect(&self.config, self.router.clone()).await?;
            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = listener.run(token).await {
                    error!("Replication listener stopped: {}", e);
                }
            });
            self.listener = Some((shutdown, handle));
        }

        self.orchestrator.start();
        self.engine.start();

        if self.seeding.is_none() {
            if let Some(path) = &self.config.seed_file {
                let seeds = load_seeds(path).await?;
                self.seeding = Some(spawn_seeding(seeds, self.frontier.clone()));
            }
        }

        info!("Application started");
        Ok(())
    }

    /// Tears down in reverse start order. Every step runs even if an
    /// earlier one failed.
    pub async fn stop(&mut self) {
        if let Some((shutdown, handle)) = self.seeding.take() {
            shutdown.cancel();
            if let Err(e) = handle.await {
                warn!("Seed task terminated abnormally: {}", e);
            }
        }

        self.engine.stop().await;
        self.orchestrator.stop().await;

        if let Some((shutdown, handle)) = self.listener.take() {
            shutdown.cancel();
            if let Err(e) = handle.await {
                warn!("Replication listener task terminated abnormally: {}", e);
            }
        }

        self.router.close_all().await;

        let crawl = self.orchestrator.stats();
        let ingest = self.engine.builder().stats();
        let routing = self.router.stats();
        info!(
            titles_crawled = crawl.titles_crawled.load(Ordering::Relaxed),
            titles_created = ingest.titles_created.load(Ordering::Relaxed),
            pairs_created = ingest.pairs_created.load(Ordering::Relaxed),
            results_rejected = self.engine.rejected(),
            events_routed = routing.routed.load(Ordering::Relaxed),
            "Application stopped"
        );
    }
}

/// One producer per graph table, keyed by the table's primary key.
async fn build_router(config: &Config) -> Result<ChangeEventRouter> {
    let schemas = graph_schemas();

    if config.kafka.create_topics {
        let topics: Vec<String> = schemas
            .iter()
            .map(|schema| config.kafka_topic_name(schema.name))
            .collect();
        TopicManager::new(&config.kafka)?.ensure_topics(&topics).await?;
    }

    let mut router = ChangeEventRouter::new();
    for schema in &schemas {
        let producer: Arc<dyn EventPublisher> = Arc::new(KafkaProducer::open(
            &config.kafka,
            config.kafka_topic_name(schema.name),
        )?);
        router.add_route(schema.name, producer, Some(schema.primary_key.to_string()));
    }
    Ok(router)
}

/// Pushes seeds onto the frontier, waiting for room rather than dropping.
fn spawn_seeding(
    seeds: Vec<TitleQuery>,
    frontier: mpsc::Sender<TitleQuery>,
) -> (CancellationToken, JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        let total = seeds.len();
        for (sent, seed) in seeds.into_iter().enumerate() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(sent, total, "Seeding interrupted");
                    return;
                }
                result = frontier.send(seed) => {
                    if result.is_err() {
                        warn!(sent, total, "Frontier closed while seeding");
                        return;
                    }
                }
            }
        }
        info!(total, "Seed titles enqueued");
    });
    (shutdown, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeding_preserves_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let seeds = vec![TitleQuery::new("Huế"), TitleQuery::new("Vinh")];

        let (_, handle) = spawn_seeding(seeds, tx);
        handle.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().title, "Huế");
        assert_eq!(rx.recv().await.unwrap().title, "Vinh");
    }

    #[tokio::test]
    async fn test_seeding_stops_on_cancel_when_frontier_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let seeds = (0..5).map(|i| TitleQuery::new(format!("t{}", i))).collect();

        let (shutdown, handle) = spawn_seeding(seeds, tx);
        assert_eq!(rx.recv().await.unwrap().title, "t0");
        shutdown.cancel();
        handle.await.unwrap();

        let mut rest = Vec::new();
        while let Ok(seed) = rx.try_recv() {
            rest.push(seed);
        }
        assert!(rest.len() <= 1, "{:?}", rest);
    }
}
