//! Error types and result handling for wikigraph-cdc.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use wikigraph_cdc::{Error, Result};
//!
//! fn open_store() -> Result<()> {
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match open_store() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for wikigraph-cdc operations.
///
/// Variants fall into the classes the pipeline cares about: transient
/// failures that are retried in place, per-item failures that abandon a
/// single title, link or event, and startup failures that stop a component.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error from the regular (non-replication) connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// ErrorResponse sent by the server on the replication connection.
    #[error("PostgreSQL server error {code}: {message}")]
    PgServer {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// HTTP transport error talking to the link-listing API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Deduplication cache backend error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// JSON serialization error when encoding or decoding payloads.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, from sockets or checkpoint files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Protocol-level error in the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Row change referencing a relation whose schema was never announced.
    #[error("Unknown relation ID: {0}")]
    UnknownRelation(u32),

    /// Upstream API answered with a status that is not worth retrying,
    /// or kept answering with a retryable one until attempts ran out.
    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus {
        /// Status code of the last response
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Every attempt for a request failed.
    #[error("Request to {url} failed after {attempts} attempts: {cause}")]
    FetchExhausted {
        /// Requested URL
        url: String,
        /// Number of attempts made
        attempts: u32,
        /// Last failure seen
        cause: String,
    },

    /// Response body was not JSON.
    #[error("Unexpected content type {content_type:?} from {url}")]
    ContentType {
        /// Content-Type header, if any
        content_type: Option<String>,
        /// Requested URL
        url: String,
    },

    /// Insert rejected by a uniqueness constraint.
    #[error("Duplicate row in {table}: {detail}")]
    Duplicate {
        /// Table the insert targeted
        table: String,
        /// Server detail, usually naming the conflicting key
        detail: String,
    },

    /// Insert rejected because a row it references does not exist yet.
    #[error("Missing referenced row for {table}: {detail}")]
    MissingReference {
        /// Table the insert targeted
        table: String,
        /// Server detail, usually naming the missing key
        detail: String,
    },

    /// A bounded queue was closed by its other side.
    #[error("Queue closed: {0}")]
    QueueClosed(&'static str),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit a run loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the failure is transient and the same request may succeed
    /// when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout { .. } => true,
            Error::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate { .. })
    }

    pub fn is_missing_reference(&self) -> bool {
        matches!(self, Error::MissingReference { .. })
    }

    /// SQLSTATE of a server-side failure, if one is attached.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::PgServer { code, .. } => Some(code.as_str()),
            Error::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Cache(e.to_string())
    }
}

/// A convenient Result type alias for wikigraph-cdc operations.
///
/// This is equivalent to `std::result::Result<T, wikigraph_cdc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
