use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Settings for the logical-replication connection. It targets the same
/// host and database as [`PostgresConfig`] but usually a different role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub username: String,
    pub password: String,
    pub slot_name: String,
    pub publication: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
    #[serde(default)]
    pub start_lsn: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    #[default]
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub query_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub results_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_task_capacity")]
    pub task_capacity: usize,
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_enqueue_timeout_secs")]
    pub enqueue_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default)]
    pub create_topics: bool,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("WIKIGRAPH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database,
            self.postgres.connect_timeout_secs
        )
    }

    pub fn kafka_topic_name(&self, table_name: &str) -> String {
        self.kafka.topic_name(table_name)
    }
}

impl KafkaConfig {
    pub fn topic_name(&self, table_name: &str) -> String {
        format!("{}.{}", self.topic_prefix, table_name)
    }
}

impl ReplicationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl CrawlerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl IngestionConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs(self.enqueue_timeout_secs)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_idle_per_host: default_max_idle_per_host(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            query_queue_capacity: default_queue_capacity(),
            results_queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_capacity: default_task_capacity(),
            poll_wait_ms: default_poll_wait_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            enqueue_timeout_secs: default_enqueue_timeout_secs(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_wait_timeout_secs() -> u64 {
    10
}

fn default_api_base_url() -> String {
    "https://vi.wikipedia.org/w/api.php?action=query&prop=links&format=json&plnamespace=0&pllimit=max"
        .to_string()
}

fn default_user_agent() -> String {
    "wikigraph-cdc/0.1 (link graph crawler)".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_max_idle_per_host() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_workers() -> usize {
    10
}

fn default_task_capacity() -> usize {
    100
}

fn default_poll_wait_ms() -> u64 {
    1
}

fn default_dispatch_interval_ms() -> u64 {
    10
}

fn default_enqueue_timeout_secs() -> u64 {
    10
}

fn default_topic_prefix() -> String {
    "wikigraph".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    1
}
