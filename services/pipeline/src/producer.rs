//! Kafka producer wrapper for the ingestion channels.
//!
//! Publishes with `acks=all` and waits for the delivery report, so a
//! successful [`Publisher::publish`] means the broker has the message.

use crate::channel::{DeliveryResult, OutgoingMessage, ProducerError, Publisher};
use crate::config::KafkaConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Kafka-backed [`Publisher`]
pub struct KafkaPublisher {
    producer: FutureProducer,
    default_timeout: Duration,
}

impl KafkaPublisher {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            brokers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            default_timeout,
        })
    }

    /// Send a message with a custom timeout
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        let OutgoingMessage {
            topic,
            key,
            payload,
            headers,
        } = message;

        let mut kafka_headers = OwnedHeaders::new();
        for (name, value) in &headers {
            kafka_headers = kafka_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&topic)
            .payload(payload.as_slice())
            .headers(kafka_headers);
        if let Some(ref k) = key {
            record = record.key(k.as_str());
        }

        debug!(size = payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| send_error(&topic, payload.len(), e))?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

/// A record over `message.max.bytes` fails the same way on every attempt
fn send_error(topic: &str, size: usize, error: KafkaError) -> ProducerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => ProducerError::MessageTooLarge {
            topic: topic.to_string(),
            size,
        },
        _ => ProducerError::SendError {
            topic: topic.to_string(),
            message: error.to_string(),
        },
    }
}

#[async_trait::async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send_with_timeout(message, self.default_timeout).await
    }
}

impl Drop for KafkaPublisher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

/// Builder for creating producers with custom settings
pub struct ProducerBuilder {
    config: KafkaConfig,
}

impl ProducerBuilder {
    /// Start from an existing configuration
    pub fn from_config(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// Set the client ID
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the publish confirmation timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build the producer
    pub fn build(self) -> Result<KafkaPublisher, ProducerError> {
        KafkaPublisher::new(self.config)
    }
}
