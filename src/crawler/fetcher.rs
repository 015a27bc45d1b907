use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use super::api::LinkApi;
use super::types::LinkResponse;
use crate::config::CrawlerConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

/// One GET round-trip. Any `Err` is a transport-level failure.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Retrying client for the link-listing API.
pub struct FetchClient {
    transport: Arc<dyn HttpTransport>,
    api: LinkApi,
    max_attempts: u32,
    base_delay: Duration,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn HttpTransport>, api: LinkApi, config: &CrawlerConfig) -> Self {
        Self {
            transport,
            api,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
        }
    }

    /// Fetches one page of links for `title`.
    ///
    /// Transport failures, 429 and 5xx are retried with exponential backoff.
    /// Any other non-200 status, a non-JSON content type, or an undecodable
    /// body fails immediately.
    #[instrument(skip(self), fields(title = %title))]
    pub async fn fetch_links(&self, title: &str, continuation: Option<&str>) -> Result<LinkResponse> {
        let url = self.api.url_for(title, continuation);
        let response = self.fetch_with_retry(&url).await?;

        if !response.is_json() {
            return Err(Error::ContentType {
                content_type: response.content_type,
                url: url.to_string(),
            });
        }

        let links: LinkResponse = serde_json::from_slice(&response.body)?;
        debug!(
            pages = links.pages.len(),
            links = links.article_link_count(),
            more = links.continuation_token.is_some(),
            "Fetched link page"
        );
        Ok(links)
    }

    /// Backoff after failed attempt `n` (0-based) is `base * 2^n`, doubled
    /// again for 429. The delay is also observed after the last attempt, so
    /// three failures take at least 1s + 2s + 4s with the default base.
    pub async fn fetch_with_retry(&self, url: &Url) -> Result<HttpResponse> {
        let mut cause = String::new();

        for attempt in 0..self.max_attempts {
            let mut delay = self.base_delay * 2u32.saturating_pow(attempt);

            match self.transport.get(url).await {
                Err(e) => {
                    warn!(attempt = attempt + 1, url = %url, "Request failed: {}", e);
                    cause = e.to_string();
                }
                Ok(response) if response.status == 200 => return Ok(response),
                Ok(response) => {
                    let err = Error::HttpStatus {
                        status: response.status,
                        url: url.to_string(),
                    };
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if response.status == 429 {
                        delay *= 2;
                    }
                    warn!(attempt = attempt + 1, status = response.status, url = %url, "Retryable HTTP status");
                    cause = format!("status {}", response.status);
                }
            }

            debug!(?delay, "Backing off before next attempt");
            tokio::time::sleep(delay).await;
        }

        Err(Error::FetchExhausted {
            url: url.to_string(),
            attempts: self.max_attempts,
            cause,
        })
    }
}
