use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A deferred unit of work. The closure captures its own arguments, so the
/// pool never needs to know what a task operates on.
pub struct Task {
    name: &'static str,
    job: Job,
}

impl Task {
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            job: Box::new(move || f().boxed()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs the task to completion. A panic inside the task is caught and
    /// returned as its message instead of unwinding into the caller.
    pub async fn run(self) -> std::result::Result<(), String> {
        let job = self.job;
        AssertUnwindSafe(async move { job().await })
            .catch_unwind()
            .await
            .map_err(panic_message)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Bounded FIFO of pending tasks.
///
/// [`TaskQueue::push`] never waits: when the queue is full the task is
/// dropped and counted. Callers are expected to slow down when they see
/// rejections rather than retry in a tight loop.
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
    receiver: Mutex<mpsc::Receiver<Task>>,
    dropped: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, task: Task) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(task = task.name(), dropped, "Task queue full, dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(task = task.name(), dropped, "Task queue closed, dropping task");
                false
            }
        }
    }

    /// Waits at most `wait` for the next task.
    pub async fn try_pop(&self, wait: Duration) -> Option<Task> {
        let popped = tokio::time::timeout(wait, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        match popped {
            Ok(task) => task,
            Err(_) => {
                trace!("No task within poll window");
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks rejected since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
