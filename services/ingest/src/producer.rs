//! Ingress producer: turns an accepted upload into one ingest request.
//!
//! `submit` returns as soon as the broker confirms the publish. It never
//! waits for storage; the caller is told "accepted", not "stored".

use crate::config::PublishConfig;
use crate::mime::resolve_mime_type;
use backoff::ExponentialBackoff;
use photo_pipeline::messages::INGEST_REQUEST_TYPE;
use photo_pipeline::{IngestRequest, OutgoingMessage, ProducerError, Publisher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors returned to the uploading caller
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Upload too large: {0}")]
    TooLarge(String),

    #[error("Failed to encode ingest request: {0}")]
    Encoding(String),
}

impl IngestError {
    /// Whether the caller may retry the same upload later
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::BrokerUnavailable(_))
    }
}

/// Counters exposed on the health endpoint
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ProducerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub broker_failures: u64,
}

/// Publishes ingest requests for validated uploads
pub struct IngressProducer {
    publisher: Arc<dyn Publisher>,
    topic: String,
    policy: PublishConfig,
    max_message_bytes: Option<usize>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    broker_failures: AtomicU64,
}

impl IngressProducer {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            policy: PublishConfig::default(),
            max_message_bytes: None,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            broker_failures: AtomicU64::new(0),
        }
    }

    pub fn with_publish_policy(mut self, policy: PublishConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Refuse requests the broker would reject for size, before publishing
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = Some(bytes);
        self
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            broker_failures: self.broker_failures.load(Ordering::Relaxed),
        }
    }

    /// Accept an upload and hand it to the broker.
    ///
    /// Returns a fresh request id per call, even for identical uploads.
    /// Nothing counts as sent unless the broker confirmed it.
    #[instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn submit(
        &self,
        nickname: &str,
        mime_hint: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<Uuid, IngestError> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::Validation("nickname must not be empty".into()));
        }
        if payload.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::Validation("image data must not be empty".into()));
        }

        let mime_type = resolve_mime_type(mime_hint, &payload);
        let request = IngestRequest::new(nickname, mime_type, payload);
        let request_id = request.request_id;

        let message = OutgoingMessage::new_json(&self.topic, &request)
            .map_err(|e| IngestError::Encoding(e.to_string()))?
            .with_key(request_id.to_string())
            .with_message_type(INGEST_REQUEST_TYPE)
            .with_correlation_id(request_id.to_string());

        if let Some(limit) = self.max_message_bytes {
            if message.payload.len() > limit {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::TooLarge(format!(
                    "encoded request is {} bytes, the limit is {}",
                    message.payload.len(),
                    limit
                )));
            }
        }

        match self.publish_confirmed(message).await {
            Ok(()) => {}
            Err(e @ ProducerError::MessageTooLarge { .. }) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::TooLarge(e.to_string()));
            }
            Err(e) => {
                self.broker_failures.fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::BrokerUnavailable(e.to_string()));
            }
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %request_id,
            nickname = %request.nickname,
            mime_type = %request.mime_type,
            "Upload accepted"
        );

        Ok(request_id)
    }

    /// Publish with exponential backoff, bounded by the total publish budget.
    /// Each attempt is also cut off on its own so a hung broker cannot hold
    /// the caller.
    async fn publish_confirmed(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        let attempt_timeout = self.policy.attempt_timeout();
        let policy = ExponentialBackoff {
            current_interval: self.policy.initial_interval(),
            initial_interval: self.policy.initial_interval(),
            max_interval: self.policy.max_interval(),
            max_elapsed_time: Some(self.policy.timeout()),
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let message = message.clone();
            async move {
                match tokio::time::timeout(attempt_timeout, self.publisher.publish(message)).await {
                    Ok(Ok(_delivery)) => Ok(()),
                    Ok(Err(e)) if e.is_transient() => {
                        warn!(error = %e, "Publish failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                    Err(_) => {
                        warn!(timeout_ms = attempt_timeout.as_millis() as u64, "Publish timed out, retrying");
                        Err(backoff::Error::transient(ProducerError::Timeout(attempt_timeout)))
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::OCTET_STREAM;
    use photo_pipeline::{DeliveryResult, InMemoryBroker};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TOPIC: &str = "photo.ingest.requests";
    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];

    fn producer(broker: &InMemoryBroker) -> IngressProducer {
        IngressProducer::new(Arc::new(broker.clone()), TOPIC)
            .with_publish_policy(PublishConfig::with_budget(Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn test_identical_uploads_get_distinct_request_ids() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        let first = producer.submit("alice", Some("image/png"), PNG.to_vec()).await.unwrap();
        let second = producer.submit("alice", Some("image/png"), PNG.to_vec()).await.unwrap();

        assert_ne!(first, second);
        let published = broker.published(TOPIC);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].key.as_deref(), Some(first.to_string().as_str()));
        assert_eq!(published[0].header("message-type"), Some(INGEST_REQUEST_TYPE));
        assert_eq!(producer.stats().accepted, 2);
    }

    #[tokio::test]
    async fn test_published_request_carries_resolved_mime_and_trimmed_nickname() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        let request_id = producer
            .submit("  alice  ", Some(OCTET_STREAM), PNG.to_vec())
            .await
            .unwrap();

        let published = broker.published(TOPIC);
        let request = IngestRequest::decode(&published[0].payload).unwrap();
        assert_eq!(request.request_id, request_id);
        assert_eq!(request.nickname, "alice");
        assert_eq!(request.mime_type, "image/png");
        assert_eq!(request.payload, PNG);
    }

    #[tokio::test]
    async fn test_validation_errors_never_reach_the_broker() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        let blank = producer.submit("   ", None, PNG.to_vec()).await;
        assert!(matches!(blank, Err(IngestError::Validation(_))));

        let empty = producer.submit("alice", None, Vec::new()).await;
        assert!(matches!(empty, Err(IngestError::Validation(_))));

        assert!(broker.published(TOPIC).is_empty());
        assert_eq!(producer.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_reported_without_side_effect() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let producer = producer(&broker);

        let result = producer.submit("alice", None, PNG.to_vec()).await;
        match result {
            Err(e) => {
                assert!(matches!(e, IngestError::BrokerUnavailable(_)));
                assert!(e.is_retryable());
            }
            Ok(id) => panic!("unexpected success: {}", id),
        }
        assert!(broker.published(TOPIC).is_empty());
        assert_eq!(producer.stats().broker_failures, 1);
    }

    /// Counts publish calls on their way to the broker
    struct CountingPublisher {
        broker: InMemoryBroker,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.broker.publish(message).await
        }
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_before_publishing() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker).with_max_message_bytes(256);

        let result = producer.submit("alice", None, vec![7u8; 1024]).await;
        match result {
            Err(e) => {
                assert!(matches!(e, IngestError::TooLarge(_)));
                assert!(!e.is_retryable());
            }
            Ok(id) => panic!("unexpected success: {}", id),
        }
        assert!(broker.published(TOPIC).is_empty());
        assert_eq!(producer.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_broker_size_rejection_fails_without_retrying() {
        let publisher = Arc::new(CountingPublisher {
            broker: InMemoryBroker::new().with_max_message_bytes(256),
            calls: AtomicUsize::new(0),
        });
        let producer = IngressProducer::new(publisher.clone(), TOPIC)
            .with_publish_policy(PublishConfig::with_budget(Duration::from_secs(5)));

        let result = producer.submit("alice", None, vec![7u8; 1024]).await;

        assert!(matches!(result, Err(IngestError::TooLarge(_))));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        let stats = producer.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.broker_failures, 0);
    }
}
