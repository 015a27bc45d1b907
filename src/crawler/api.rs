use url::Url;

use crate::{Error, Result};

/// Builds request URLs against the link-listing endpoint.
///
/// The base URL carries the fixed query (`action=query&prop=links...`);
/// the title and the optional continuation token are appended form-encoded,
/// so spaces become `+` and separators like `|` are percent-escaped.
#[derive(Debug, Clone)]
pub struct LinkApi {
    base: Url,
}

impl LinkApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid API base URL {:?}: {}", base_url, e)))?;
        Ok(Self { base })
    }

    pub fn url_for(&self, title: &str, continuation: Option<&str>) -> Url {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("titles", title);
            if let Some(token) = continuation {
                query.append_pair("plcontinue", token);
            }
        }
        url
    }
}
