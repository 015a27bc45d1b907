//! Fetching link lists from the encyclopedia API and driving pagination.

pub mod api;
pub mod fetcher;
pub mod orchestrator;
pub mod types;

pub use api::LinkApi;
pub use fetcher::{FetchClient, HttpResponse, HttpTransport, ReqwestTransport};
pub use orchestrator::CrawlOrchestrator;
pub use types::{FetchResult, Link, LinkResponse, Page, TitleQuery, ARTICLE_NAMESPACE};
