pub mod app;
pub mod cdc;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod error;
pub mod graph;
pub mod kafka;
pub mod postgres;
pub mod queue;
pub mod seed;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
