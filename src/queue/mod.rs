//! Bounded task queue and the fixed-size worker pool that drains it.

pub mod pool;
pub mod task;

pub use pool::{PoolStats, WorkerPool};
pub use task::{Task, TaskQueue};
