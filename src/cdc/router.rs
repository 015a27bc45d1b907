use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::listener::ChangeHandler;
use crate::kafka::{Delivery, EventPublisher, JsonSerializer};
use crate::postgres::ChangeEvent;
use crate::Result;

struct Route {
    publisher: Arc<dyn EventPublisher>,
    key_column: Option<String>,
}

#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed: AtomicU64,
    pub unrouted: AtomicU64,
    pub failed: AtomicU64,
}

/// Sends each change event to the publisher registered for its table.
///
/// Events for tables without a route are dropped. Delivery is awaited per
/// event, so per-table order follows stream order.
#[derive(Default)]
pub struct ChangeEventRouter {
    routes: HashMap<String, Route>,
    stats: Arc<RouterStats>,
}

impl ChangeEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `publisher` for `table`, replacing any earlier route.
    /// With a `key_column` each message is keyed by that column's value.
    pub fn add_route(
        &mut self,
        table: impl Into<String>,
        publisher: Arc<dyn EventPublisher>,
        key_column: Option<String>,
    ) {
        self.routes.insert(
            table.into(),
            Route {
                publisher,
                key_column,
            },
        );
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Returns `Ok(None)` for a routing miss.
    pub async fn route(&self, event: &ChangeEvent) -> Result<Option<Delivery>> {
        let Some(route) = self.routes.get(&event.table) else {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            warn!(table = %event.table, op = %event.op, "No producer for table, dropping event");
            return Ok(None);
        };

        let payload = JsonSerializer::serialize(event)?;
        let key = route
            .key_column
            .as_deref()
            .and_then(|column| event.fields.get(column))
            .and_then(|value| value.as_deref());

        let delivery = route.publisher.send(key, &payload).await?;
        debug!(
            table = %event.table,
            op = %event.op,
            lsn = %event.lsn,
            topic = route.publisher.topic(),
            partition = delivery.partition,
            offset = delivery.offset,
            "Routed change event"
        );
        Ok(Some(delivery))
    }

    /// Closes every publisher. Failures are logged and do not stop the rest.
    pub async fn close_all(&self) {
        for (table, route) in &self.routes {
            if let Err(e) = route.publisher.close().await {
                error!(table = %table, "Failed to close producer: {}", e);
            }
        }
    }
}

#[async_trait]
impl ChangeHandler for ChangeEventRouter {
    async fn handle(&self, event: ChangeEvent) {
        match self.route(&event).await {
            Ok(Some(_)) => {
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(table = %event.table, lsn = %event.lsn, "Failed to deliver change event: {}", e);
            }
        }
    }
}
