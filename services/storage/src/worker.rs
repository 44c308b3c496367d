//! Storage worker: turns ingest requests into durable image records.
//!
//! A delivery is acknowledged only after the record is committed. Failed or
//! slow inserts are left for redelivery; undecodable requests are rejected
//! straight to the dead letter topic.

use crate::cache::{bounded, ImageCache};
use crate::image_store::{ImageStore, InsertOutcome, NewImage};
use async_trait::async_trait;
use photo_pipeline::messages::INGEST_COMPLETED_TYPE;
use photo_pipeline::{
    Disposition, IncomingMessage, IngestCompleted, IngestRequest, MessageHandler, OutgoingMessage,
    Publisher, TopicConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct StorageWorker {
    store: Arc<dyn ImageStore>,
    cache: Arc<dyn ImageCache>,
    publisher: Arc<dyn Publisher>,
    completed_topic: String,
    routing_key: String,
    store_timeout: Duration,
    cache_timeout: Duration,
}

impl StorageWorker {
    pub fn new(
        store: Arc<dyn ImageStore>,
        cache: Arc<dyn ImageCache>,
        publisher: Arc<dyn Publisher>,
        topics: &TopicConfig,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            completed_topic: topics.ingest_completed.clone(),
            routing_key: topics.uploaded_routing_key.clone(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    /// Bound a single insert; an insert that runs longer is retried
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Bound the post-insert invalidation so a stalled cache cannot hold the offset
    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    async fn insert_image(&self, request: &IngestRequest) -> Result<InsertOutcome, String> {
        let image = NewImage {
            request_id: request.request_id,
            nickname: request.nickname.clone(),
            mime_type: request.mime_type.clone(),
            payload: request.payload.clone(),
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.store_timeout, self.store.insert(image)).await;
        metrics::histogram!("storage.insert.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("insert timed out after {:?}", self.store_timeout)),
        }
    }

    /// Announce the stored image. Subscribers tolerate duplicates, so a
    /// failure here never undoes the acknowledgement.
    async fn publish_completed(&self, request: &IngestRequest, outcome: InsertOutcome) {
        let event = IngestCompleted::new(
            outcome.image_id(),
            request.request_id,
            &request.nickname,
            &request.mime_type,
        );

        let message = match OutgoingMessage::new_json(&self.completed_topic, &event) {
            Ok(message) => message
                .with_key(outcome.image_id().to_string())
                .with_routing_key(&self.routing_key)
                .with_message_type(INGEST_COMPLETED_TYPE)
                .with_correlation_id(request.request_id.to_string()),
            Err(e) => {
                error!(error = %e, "Failed to encode ingest-completed event");
                metrics::counter!("storage.completion.publish_failed").increment(1);
                return;
            }
        };

        if let Err(e) = self.publisher.publish(message).await {
            warn!(
                error = %e,
                image_id = %outcome.image_id(),
                request_id = %request.request_id,
                "Failed to publish ingest-completed event"
            );
            metrics::counter!("storage.completion.publish_failed").increment(1);
        }
    }
}

#[async_trait]
impl MessageHandler for StorageWorker {
    #[instrument(skip(self, message), fields(offset = message.metadata.offset, attempt = message.metadata.attempt))]
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        let request = match IngestRequest::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed ingest request");
                metrics::counter!("storage.messages.malformed").increment(1);
                return Disposition::reject(e.to_string());
            }
        };

        debug!(
            request_id = %request.request_id,
            nickname = %request.nickname,
            size = request.payload.len(),
            "Received ingest request"
        );

        let outcome = match self.insert_image(&request).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                error!(request_id = %request.request_id, reason = %reason, "Failed to store image");
                metrics::counter!("storage.messages.failed").increment(1);
                return Disposition::retry(reason);
            }
        };

        match outcome {
            InsertOutcome::Inserted(image_id) => {
                metrics::counter!("storage.messages.processed").increment(1);
                metrics::counter!("storage.bytes.stored").increment(request.payload.len() as u64);
                info!(
                    image_id = %image_id,
                    request_id = %request.request_id,
                    nickname = %request.nickname,
                    "Image stored"
                );

                let invalidation = self.cache.invalidate(&request.nickname);
                if let Err(e) = bounded(self.cache_timeout, invalidation).await {
                    warn!(error = %e, nickname = %request.nickname, "Cache invalidation failed");
                }
            }
            InsertOutcome::AlreadyApplied(image_id) => {
                metrics::counter!("storage.messages.duplicate").increment(1);
                info!(
                    image_id = %image_id,
                    request_id = %request.request_id,
                    "Request already stored, re-announcing"
                );
            }
        }

        self.publish_completed(&request, outcome).await;
        Disposition::Ack
    }

    async fn on_dead_letter(&self, message: &IncomingMessage, reason: &str) {
        metrics::counter!("storage.messages.dead_lettered").increment(1);
        error!(
            offset = message.metadata.offset,
            attempt = message.metadata.attempt,
            key = ?message.key_str(),
            reason = %reason,
            "Ingest request dead-lettered"
        );
    }
}
