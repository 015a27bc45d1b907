//! Change data capture: streaming row changes out of PostgreSQL and routing
//! them to per-table topics.

pub mod listener;
pub mod router;

pub use listener::{ChangeHandler, ListenerSettings, ListenerState, ReplicationListener};
pub use router::{ChangeEventRouter, RouterStats};
