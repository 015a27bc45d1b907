use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Namespace id of regular articles. Links into any other namespace
/// (talk pages, templates, categories...) are not part of the graph.
pub const ARTICLE_NAMESPACE: i64 = 0;

/// A title waiting to be crawled. `id` is known when the title row was
/// created by this process before the title was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleQuery {
    pub title: String,
    pub id: Option<Uuid>,
}

impl TitleQuery {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            id: None,
        }
    }

    pub fn with_id(title: impl Into<String>, id: Uuid) -> Self {
        Self {
            title: title.into(),
            id: Some(id),
        }
    }
}

/// One successful API page for a title.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: TitleQuery,
    pub response: LinkResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    pub ns: i64,
    pub title: String,
}

impl Link {
    pub fn is_article(&self) -> bool {
        self.ns == ARTICLE_NAMESPACE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub pageid: Option<i64>,
    #[serde(default)]
    pub ns: i64,
    pub title: String,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub missing: Option<String>,
}

impl Page {
    pub fn article_links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|link| link.is_article())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Normalization {
    pub from: String,
    pub to: String,
}

/// Decoded `prop=links` response.
///
/// `pages` is keyed by page id as sent by the API (missing pages get
/// negative ids). An empty continuation token is treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawLinkResponse")]
pub struct LinkResponse {
    pub pages: BTreeMap<String, Page>,
    pub normalized: Vec<Normalization>,
    pub continuation_token: Option<String>,
}

impl LinkResponse {
    pub fn article_link_count(&self) -> usize {
        self.pages.values().map(|p| p.article_links().count()).sum()
    }
}

#[derive(Deserialize)]
struct RawLinkResponse {
    #[serde(default, rename = "continue")]
    continuation: Option<RawContinue>,
    #[serde(default)]
    query: Option<RawQuery>,
}

#[derive(Deserialize)]
struct RawContinue {
    #[serde(default)]
    plcontinue: Option<String>,
}

#[derive(Deserialize)]
struct RawQuery {
    #[serde(default)]
    normalized: Vec<Normalization>,
    #[serde(default)]
    pages: BTreeMap<String, Page>,
}

impl From<RawLinkResponse> for LinkResponse {
    fn from(raw: RawLinkResponse) -> Self {
        let (pages, normalized) = match raw.query {
            Some(query) => (query.pages, query.normalized),
            None => (BTreeMap::new(), Vec::new()),
        };
        let continuation_token = raw
            .continuation
            .and_then(|c| c.plcontinue)
            .filter(|token| !token.is_empty());

        Self {
            pages,
            normalized,
            continuation_token,
        }
    }
}
