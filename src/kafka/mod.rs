pub mod producer;
pub mod serializer;
pub mod topic_manager;

pub use producer::{Delivery, EventPublisher, KafkaProducer};
pub use serializer::JsonSerializer;
pub use topic_manager::TopicManager;
