use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::{Error, Result};

/// Where the broker stored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A producer bound to a single topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    fn topic(&self) -> &str;

    /// Sends one message and waits for the broker's acknowledgment.
    async fn send(&self, key: Option<&str>, payload: &[u8]) -> Result<Delivery>;

    /// Flushes anything still buffered.
    async fn close(&self) -> Result<()>;
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaProducer {
    pub fn open(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.delivery_timeout_ms.to_string())
            .create()?;

        let topic = topic.into();
        info!(topic = %topic, "Opened Kafka producer");
        Ok(Self {
            producer,
            topic,
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, key: Option<&str>, payload: &[u8]) -> Result<Delivery> {
        let mut record = FutureRecord::<str, [u8]>::to(&self.topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        debug!(topic = %self.topic, partition, offset, "Message delivered");
        Ok(Delivery { partition, offset })
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::Connection(format!("Producer flush task failed: {}", e)))??;

        info!(topic = %self.topic, "Closed Kafka producer");
        Ok(())
    }
}
