//! Fan-out consumer for ingest-completed events.
//!
//! Observability only: every delivery is acknowledged once its side effect
//! ran, whether or not that side effect (or decoding) succeeded, so this
//! consumer never applies backpressure to the completion topic.

use crate::channel::{Disposition, IncomingMessage, MessageHandler};
use crate::messages::IngestCompleted;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
#[error("downstream trigger failed: {0}")]
pub struct HookError(pub String);

/// Downstream side effect run for every uploaded image
#[async_trait::async_trait]
pub trait UploadedHook: Send + Sync {
    async fn on_uploaded(&self, event: &IngestCompleted) -> Result<(), HookError>;
}

/// Handler that logs (and optionally forwards) upload notifications
pub struct NotificationHandler {
    routing_key: String,
    hooks: Vec<Arc<dyn UploadedHook>>,
    received: AtomicU64,
}

impl NotificationHandler {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            hooks: Vec::new(),
            received: AtomicU64::new(0),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn UploadedHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Notifications accepted so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        // Messages without a routing key predate the header and are accepted.
        if let Some(key) = message.routing_key() {
            if key != self.routing_key {
                debug!(routing_key = %key, "Skipping event for another routing key");
                return Disposition::Ack;
            }
        }

        let event = match IngestCompleted::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    offset = message.metadata.offset,
                    "Dropping undecodable upload notification"
                );
                return Disposition::Ack;
            }
        };

        self.received.fetch_add(1, Ordering::Relaxed);
        info!(
            image_id = %event.image_id,
            request_id = ?event.request_id,
            nickname = ?event.nickname,
            "Received notification for uploaded image"
        );

        for hook in &self.hooks {
            if let Err(e) = hook.on_uploaded(&event).await {
                warn!(image_id = %event.image_id, error = %e, "Upload hook failed");
            }
        }

        Disposition::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{OutgoingMessage, Publisher};
    use crate::memory::InMemoryBroker;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Uuid>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl UploadedHook for Recording {
        async fn on_uploaded(&self, event: &IngestCompleted) -> Result<(), HookError> {
            self.seen.lock().unwrap().push(event.image_id);
            if self.fail {
                return Err(HookError("webhook returned 500".into()));
            }
            Ok(())
        }
    }

    fn completed(image_id: Uuid, routing_key: &str) -> OutgoingMessage {
        let event = IngestCompleted::new(image_id, Uuid::new_v4(), "alice", "image/png");
        OutgoingMessage::new_json("photo.images.uploaded", &event)
            .unwrap()
            .with_routing_key(routing_key)
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let broker = InMemoryBroker::new();
        let first = broker.subscriber("photo.images.uploaded", "notifier-1");
        let second = broker.subscriber("photo.images.uploaded", "notifier-2");

        let image_id = Uuid::new_v4();
        broker.publish(completed(image_id, "image.uploaded")).await.unwrap();

        let hook_a = Arc::new(Recording::default());
        let hook_b = Arc::new(Recording::default());
        let handler_a = NotificationHandler::new("image.uploaded").with_hook(hook_a.clone());
        let handler_b = NotificationHandler::new("image.uploaded").with_hook(hook_b.clone());

        first.drain(&handler_a).await;
        second.drain(&handler_b).await;

        assert_eq!(*hook_a.seen.lock().unwrap(), vec![image_id]);
        assert_eq!(*hook_b.seen.lock().unwrap(), vec![image_id]);
    }

    #[tokio::test]
    async fn test_failed_hook_still_acks() {
        let broker = InMemoryBroker::new();
        let subscriber = broker.subscriber("photo.images.uploaded", "notifier");
        broker
            .publish(completed(Uuid::new_v4(), "image.uploaded"))
            .await
            .unwrap();

        let hook = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let handler = NotificationHandler::new("image.uploaded").with_hook(hook.clone());

        // One delivery only: a failing hook must not cause redelivery.
        assert_eq!(subscriber.drain(&handler).await, 1);
        assert_eq!(hook.seen.lock().unwrap().len(), 1);
        assert!(broker.published("photo.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_plain_token_and_garbage_are_acked() {
        let broker = InMemoryBroker::new();
        let subscriber = broker.subscriber("photo.images.uploaded", "notifier");

        let image_id = Uuid::new_v4();
        broker
            .publish(OutgoingMessage::new(
                "photo.images.uploaded",
                image_id.to_string().into_bytes(),
            ))
            .await
            .unwrap();
        broker
            .publish(OutgoingMessage::new("photo.images.uploaded", b"\xff\xfe".to_vec()))
            .await
            .unwrap();

        let handler = NotificationHandler::new("image.uploaded");
        assert_eq!(subscriber.drain(&handler).await, 2);
        assert_eq!(handler.received(), 1);
        assert!(broker.published("photo.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_other_routing_keys_are_skipped() {
        let broker = InMemoryBroker::new();
        let subscriber = broker.subscriber("photo.images.uploaded", "notifier");
        broker
            .publish(completed(Uuid::new_v4(), "image.deleted"))
            .await
            .unwrap();

        let handler = NotificationHandler::new("image.uploaded");
        subscriber.drain(&handler).await;
        assert_eq!(handler.received(), 0);
    }
}
