//! Claim-then-persist protocol for entity keys.
//!
//! A cache key exists if and only if the row it names has been persisted.
//! The first caller to claim a key owns the insert; every other caller reads
//! the winner's id from the cache. A failed insert releases the claim so the
//! key can be claimed again later.

use std::future::Future;
use tracing::{debug, error};
use uuid::Uuid;

use super::cache::DedupCache;
use crate::{Error, Result};

/// Rounds spent re-claiming a key whose owner released it between our
/// failed claim and our read.
const CLAIM_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimed {
    /// This caller persisted the row.
    Created(Uuid),
    /// Another caller owns the row.
    Existing(Uuid),
}

impl Claimed {
    pub fn id(&self) -> Uuid {
        match self {
            Claimed::Created(id) | Claimed::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Claimed::Created(_))
    }
}

/// Resolves `key` to a canonical id, calling `persist` with a fresh
/// candidate id only if this caller wins the claim.
pub async fn claim<F, Fut>(cache: &dyn DedupCache, key: &str, persist: F) -> Result<Claimed>
where
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for _ in 0..CLAIM_ROUNDS {
        let candidate = Uuid::new_v4();

        if cache.set_if_absent(key, &candidate.to_string()).await? {
            return match persist(candidate).await {
                Ok(()) => Ok(Claimed::Created(candidate)),
                Err(e) => {
                    if let Err(release) = cache.delete(key).await {
                        error!(key, "Failed to release claim after failed insert: {}", release);
                    }
                    Err(e)
                }
            };
        }

        match cache.get(key).await? {
            Some(value) => {
                let id = Uuid::parse_str(&value)
                    .map_err(|e| Error::Cache(format!("Invalid id {:?} under {}: {}", value, key, e)))?;
                return Ok(Claimed::Existing(id));
            }
            None => {
                debug!(key, "Claim released concurrently, retrying");
                tokio::task::yield_now().await;
            }
        }
    }

    Err(Error::Cache(format!(
        "Could not claim or resolve {} after {} rounds",
        key, CLAIM_ROUNDS
    )))
}
