use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::KafkaConfig;
use crate::Result;

/// Creates per-table topics before producers start writing to them.
pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication_factor: i32,
}

impl TopicManager {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .create()?;

        Ok(Self {
            admin_client,
            partitions: config.partitions,
            replication_factor: config.replication_factor,
        })
    }

    /// Creates every topic in `topics`; topics that already exist are left
    /// untouched.
    #[instrument(skip(self))]
    pub async fn ensure_topics(&self, topics: &[String]) -> Result<()> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|name| {
                NewTopic::new(
                    name.as_str(),
                    self.partitions,
                    TopicReplication::Fixed(self.replication_factor),
                )
                .set("cleanup.policy", "delete")
            })
            .collect();

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));
        let results = self.admin_client.create_topics(&new_topics, &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "Created topic"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    info!(topic = %topic, "Topic already exists")
                }
                Err((_, code)) => return Err(KafkaError::AdminOp(code).into()),
            }
        }

        Ok(())
    }
}
