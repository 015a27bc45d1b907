#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use url::Url;
use wikigraph_cdc::config::{
    CacheConfig, Config, CrawlerConfig, IngestionConfig, KafkaConfig, PostgresConfig,
    ReplicationConfig,
};
use wikigraph_cdc::crawler::{HttpResponse, HttpTransport};
use wikigraph_cdc::Result;

/// Configuration for the live tests, overridable through `TEST_*` variables.
pub fn get_test_config() -> Config {
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    };

    let replication = ReplicationConfig {
        username: postgres.username.clone(),
        password: postgres.password.clone(),
        slot_name: format!("test_slot_{}", std::process::id()),
        publication: format!("test_publication_{}", std::process::id()),
        heartbeat_interval_secs: 1,
        wait_timeout_secs: 1,
        checkpoint_file: None,
        start_lsn: None,
    };

    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        topic_prefix: format!("test_{}", std::process::id()),
        compression: "none".to_string(),
        acks: "all".to_string(),
        linger_ms: 0,
        delivery_timeout_ms: 5_000,
        create_topics: true,
        partitions: 1,
        replication_factor: 1,
    };

    Config {
        postgres,
        replication,
        cache: CacheConfig::Memory,
        crawler: CrawlerConfig::default(),
        ingestion: IngestionConfig::default(),
        kafka,
        seed_file: None,
    }
}

/// An in-process stand-in for the link-listing API.
///
/// Each title maps to its pages of links; every page but the last carries a
/// continuation token of the form `<title>|<page index>`.
pub struct FakeWiki {
    pages: HashMap<String, Vec<Vec<(i64, String)>>>,
    pub requests: Mutex<Vec<Url>>,
}

impl FakeWiki {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Adds `title` with one page per entry in `pages`; links are article
    /// links unless prefixed with `Template:`.
    pub fn with_title(mut self, title: &str, pages: &[&[&str]]) -> Self {
        let pages = pages
            .iter()
            .map(|links| {
                links
                    .iter()
                    .map(|link| {
                        let ns = if link.starts_with("Template:") { 10 } else { 0 };
                        (ns, link.to_string())
                    })
                    .collect()
            })
            .collect();
        self.pages.insert(title.to_string(), pages);
        self
    }

    pub fn requests_for(&self, title: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.query_pairs().any(|(k, v)| k == "titles" && v == title))
            .count()
    }

    fn respond(&self, title: &str, continuation: Option<&str>) -> serde_json::Value {
        let Some(pages) = self.pages.get(title) else {
            return json!({
                "query": { "pages": { "-1": { "ns": 0, "title": title, "missing": "" } } }
            });
        };

        let index = continuation
            .and_then(|token| token.rsplit('|').next())
            .and_then(|index| index.parse::<usize>().ok())
            .unwrap_or(0);
        let links: Vec<_> = pages
            .get(index)
            .map(|links| {
                links
                    .iter()
                    .map(|(ns, link)| json!({ "ns": ns, "title": link }))
                    .collect()
            })
            .unwrap_or_default();

        let mut body = json!({
            "batchcomplete": "",
            "query": {
                "pages": { "100": { "pageid": 100, "ns": 0, "title": title, "links": links } }
            }
        });
        if index + 1 < pages.len() {
            body["continue"] = json!({
                "plcontinue": format!("{}|{}", title, index + 1),
                "continue": "||"
            });
        }
        body
    }
}

#[async_trait]
impl HttpTransport for FakeWiki {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(url.clone());

        let mut title = None;
        let mut continuation = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "titles" => title = Some(value.into_owned()),
                "plcontinue" => continuation = Some(value.into_owned()),
                _ => {}
            }
        }

        let body = self.respond(title.as_deref().unwrap_or_default(), continuation.as_deref());
        Ok(HttpResponse {
            status: 200,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: Bytes::from(serde_json::to_vec(&body)?),
        })
    }
}
