use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ingest::GraphBuilder;
use crate::config::IngestionConfig;
use crate::crawler::FetchResult;
use crate::queue::{PoolStats, Task, TaskQueue, WorkerPool};

/// Moves fetch results from the results queue into the worker pool, one
/// ingestion task per result.
pub struct IngestionEngine {
    builder: Arc<GraphBuilder>,
    pool: WorkerPool,
    results: Arc<Mutex<mpsc::Receiver<FetchResult>>>,
    dispatch_interval: Duration,
    rejected: Arc<AtomicU64>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl IngestionEngine {
    pub fn new(
        builder: Arc<GraphBuilder>,
        results: mpsc::Receiver<FetchResult>,
        config: &IngestionConfig,
    ) -> Self {
        Self {
            builder,
            pool: WorkerPool::new(config.workers, config.task_capacity, config.poll_wait()),
            results: Arc::new(Mutex::new(results)),
            dispatch_interval: config.dispatch_interval(),
            rejected: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn builder(&self) -> Arc<GraphBuilder> {
        self.builder.clone()
    }

    /// Fetch results the pool refused. Each one is a page of links that will
    /// never be ingested.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.pool.start();
        self.shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            builder: self.builder.clone(),
            queue: self.pool.queue(),
            results: self.results.clone(),
            dispatch_interval: self.dispatch_interval,
            rejected: self.rejected.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.handle = Some(tokio::spawn(dispatcher.run()));
        info!("Ingestion engine started");
    }

    /// Stops dispatching, then lets the pool finish its in-flight tasks.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown.cancel();
            if let Err(e) = handle.await {
                warn!("Dispatch loop terminated abnormally: {}", e);
            }
        }
        self.pool.stop().await;
        info!("Ingestion engine stopped");
    }
}

struct Dispatcher {
    builder: Arc<GraphBuilder>,
    queue: Arc<TaskQueue>,
    results: Arc<Mutex<mpsc::Receiver<FetchResult>>>,
    dispatch_interval: Duration,
    rejected: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn run(self) {
        let mut results = self.results.lock().await;

        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = results.recv() => match next {
                    Some(result) => result,
                    None => {
                        info!("Results queue closed");
                        break;
                    }
                },
            };

            let title = result.source.title.clone();
            let builder = self.builder.clone();
            let task = Task::new("ingest", move || async move {
                if let Err(e) = builder.ingest(result).await {
                    warn!("Ingestion failed: {}", e);
                }
            });

            if !self.queue.push(task) {
                let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(title = %title, rejected, "Worker pool saturated, fetch result dropped");
                // Give the workers a chance to drain before the next result.
                tokio::time::sleep(self.dispatch_interval).await;
            }
        }

        debug!("Dispatch loop exiting");
    }
}
