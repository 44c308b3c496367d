//! Photo Pipeline - message channels for asynchronous image ingestion
//!
//! This library is the broker seam of the photo service. It provides:
//!
//! - `Publisher` / `Subscriber` capabilities that services depend on instead
//!   of a concrete broker client
//! - Kafka implementations (`KafkaPublisher`, `KafkaSubscriber`) with
//!   ack-after-processing, bounded redelivery and dead-lettering
//! - An in-memory broker with the same contract for tests and single
//!   process runs
//! - The versioned `IngestRequest` / `IngestCompleted` payloads
//! - The upload notification consumer
//!
//! # Example
//!
//! ```rust,no_run
//! use photo_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(config.clone())?);
//!
//!     let subscriber = SubscriberBuilder::from_config(config.clone())
//!         .with_dlq_publisher(publisher)
//!         .build()?;
//!     subscriber.subscribe_ingest_completed()?;
//!
//!     let handler = Arc::new(NotificationHandler::new(&config.topics.uploaded_routing_key));
//!     subscriber.run(handler).await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod consumer;
pub mod memory;
pub mod messages;
pub mod notification;
pub mod producer;

// Re-export main types
pub use channel::{
    send_to_dlq, ConsumerError, DeliveryResult, Disposition, IncomingMessage, MessageHandler,
    MessageMetadata, OutgoingMessage, ProducerError, Publisher, Settlement, Subscriber,
};
pub use config::{
    ConfigError, ConsumerConfig, DeliveryConfig, KafkaConfig, SecurityConfig, TopicConfig,
};
pub use consumer::{KafkaSubscriber, SubscriberBuilder};
pub use memory::{InMemoryBroker, InMemorySubscriber};
pub use messages::{DeadLetter, IngestCompleted, IngestRequest, MessageError};
pub use notification::{HookError, NotificationHandler, UploadedHook};
pub use producer::{KafkaPublisher, ProducerBuilder};

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{
        Disposition, IncomingMessage, MessageHandler, OutgoingMessage, Publisher, Subscriber,
    };
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{KafkaSubscriber, SubscriberBuilder};
    pub use crate::notification::NotificationHandler;
    pub use crate::producer::KafkaPublisher;
    pub use async_trait::async_trait;
}
