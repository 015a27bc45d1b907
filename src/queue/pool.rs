use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::task::{Task, TaskQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub dropped: u64,
    pub executed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed number of workers polling a shared [`TaskQueue`].
///
/// Stopping is cooperative: each worker checks the shutdown token between
/// poll cycles, so a task that is already running always completes.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    size: usize,
    poll_wait: Duration,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, capacity: usize, poll_wait: Duration) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new(capacity)),
            size: size.max(1),
            poll_wait,
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Non-blocking. `false` means the task was dropped.
    pub fn submit(&self, task: Task) -> bool {
        self.queue.push(task)
    }

    /// Shared handle for producers that live outside the pool.
    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.shutdown = CancellationToken::new();
        for id in 0..self.size {
            let queue = self.queue.clone();
            let counters = self.counters.clone();
            let shutdown = self.shutdown.clone();
            let poll_wait = self.poll_wait;
            self.workers.push(tokio::spawn(async move {
                run_worker(id, queue, counters, shutdown, poll_wait).await;
            }));
        }
        info!(workers = self.size, capacity = self.queue.capacity(), "Worker pool started");
    }

    /// Signals every worker and waits for them to finish their current cycle.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        self.shutdown.cancel();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker terminated abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            executed: self.counters.executed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<TaskQueue>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    poll_wait: Duration,
) {
    debug!(worker = id, "Worker started");

    while !shutdown.is_cancelled() {
        let Some(task) = queue.try_pop(poll_wait).await else {
            continue;
        };

        let name = task.name();
        match task.run().await {
            Ok(()) => {
                counters.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, task = name, "Task panicked: {}", panic);
            }
        }
    }

    debug!(worker = id, "Worker exiting");
}
