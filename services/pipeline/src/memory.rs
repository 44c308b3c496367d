//! In-process broker with the same delivery contract as the Kafka channels.
//!
//! Each (topic, group) pair owns one queue. Publishing fans a message out
//! to every group bound to the topic; subscribers sharing a group compete
//! for its messages. Unacknowledged messages are re-enqueued until the
//! attempt bound, then dead-lettered. A message whose dead letter cannot be
//! published stays queued. Messages are not persisted.

use crate::channel::{
    send_to_dlq, ConsumerError, DeliveryResult, IncomingMessage, MessageHandler, MessageMetadata,
    OutgoingMessage, ProducerError, Publisher, Settlement, Subscriber,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;
const DEFAULT_DLQ_TOPIC: &str = "photo.dlq";
const DEAD_LETTER_RETRY_DELAY: Duration = Duration::from_millis(10);

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>>;

#[derive(Clone)]
struct GroupQueue {
    tx: mpsc::UnboundedSender<IncomingMessage>,
    rx: SharedReceiver,
}

impl GroupQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct TopicState {
    groups: HashMap<String, GroupQueue>,
    log: Vec<OutgoingMessage>,
    next_offset: i64,
}

/// In-memory broker; cheap to clone, clones share state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
    unavailable: Arc<AtomicBool>,
    max_message_bytes: Option<usize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse payloads larger than `bytes`, like a broker's `message.max.bytes`
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = Some(bytes);
        self
    }

    /// Simulate the broker going away (publishes fail) or coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Create the group's queue on the topic if it does not exist yet.
    /// Only bound groups receive messages published afterwards.
    pub fn bind(&self, topic: &str, group: &str) {
        self.group_queue(topic, group);
    }

    /// Remove a group's queue, discarding anything still pending on it
    pub fn unbind(&self, topic: &str, group: &str) {
        if let Ok(mut topics) = self.topics.lock() {
            if let Some(state) = topics.get_mut(topic) {
                state.groups.remove(group);
            }
        }
    }

    /// Subscribe to a topic as a member of a consumer group
    pub fn subscriber(&self, topic: &str, group: &str) -> InMemorySubscriber {
        let queue = self.group_queue(topic, group);
        let (shutdown_tx, _) = broadcast::channel(1);
        InMemorySubscriber {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            queue,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            dead_letter_topic: DEFAULT_DLQ_TOPIC.to_string(),
            shutdown_tx,
        }
    }

    /// Every message published to the topic so far
    pub fn published(&self, topic: &str) -> Vec<OutgoingMessage> {
        self.topics
            .lock()
            .map(|topics| {
                topics
                    .get(topic)
                    .map(|state| state.log.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn group_queue(&self, topic: &str, group: &str) -> GroupQueue {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_insert_with(GroupQueue::new)
            .clone()
    }
}

#[async_trait::async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProducerError::NotConnected);
        }
        if let Some(limit) = self.max_message_bytes {
            if message.payload.len() > limit {
                return Err(ProducerError::MessageTooLarge {
                    topic: message.topic.clone(),
                    size: message.payload.len(),
                });
            }
        }

        let mut topics = self
            .topics
            .lock()
            .map_err(|e| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;
        let state = topics.entry(message.topic.clone()).or_default();

        let offset = state.next_offset;
        state.next_offset += 1;

        let incoming = IncomingMessage {
            payload: message.payload.clone(),
            metadata: MessageMetadata {
                topic: message.topic.clone(),
                partition: 0,
                offset,
                key: message.key.as_ref().map(|k| k.as_bytes().to_vec()),
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                headers: message.headers.iter().cloned().collect(),
                attempt: 1,
            },
        };

        for queue in state.groups.values() {
            // A closed receiver only means nobody will ever read that group
            let _ = queue.tx.send(incoming.clone());
        }

        let result = DeliveryResult {
            topic: message.topic.clone(),
            partition: 0,
            offset,
            key: message.key.clone(),
        };
        state.log.push(message);

        Ok(result)
    }
}

/// Subscriber on an [`InMemoryBroker`] queue
pub struct InMemorySubscriber {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    queue: GroupQueue,
    max_delivery_attempts: u32,
    dead_letter_topic: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl InMemorySubscriber {
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }

    /// Process queued messages until the queue is empty, including any
    /// redeliveries produced along the way. Returns the deliveries handled.
    /// Does not return while a dead letter keeps failing to publish.
    pub async fn drain(&self, handler: &dyn MessageHandler) -> usize {
        let mut handled = 0;
        loop {
            let next = {
                let mut rx = self.queue.rx.lock().await;
                rx.try_recv().ok()
            };
            match next {
                Some(message) => {
                    self.dispatch(handler, message).await;
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    async fn dispatch(&self, handler: &dyn MessageHandler, message: IncomingMessage) {
        debug!(
            topic = %self.topic,
            group = %self.group,
            offset = message.metadata.offset,
            attempt = message.metadata.attempt,
            "Delivering message"
        );

        let disposition = handler.handle(&message).await;
        match disposition.settlement(message.metadata.attempt, self.max_delivery_attempts) {
            Settlement::Commit => {}
            Settlement::Redeliver { reason } => {
                warn!(
                    offset = message.metadata.offset,
                    attempt = message.metadata.attempt,
                    reason = %reason,
                    "Requeueing unacknowledged message"
                );
                self.requeue(message);
            }
            Settlement::DeadLetter { reason } => {
                let hand_off =
                    send_to_dlq(&self.broker, &self.dead_letter_topic, &message, &reason).await;
                match Settlement::after_dead_letter(&hand_off, &reason) {
                    Settlement::Redeliver { reason } => {
                        warn!(
                            offset = message.metadata.offset,
                            reason = %reason,
                            "Keeping message queued until its dead letter is published"
                        );
                        tokio::time::sleep(DEAD_LETTER_RETRY_DELAY).await;
                        self.requeue(message);
                    }
                    _ => handler.on_dead_letter(&message, &reason).await,
                }
            }
        }
    }

    fn requeue(&self, mut message: IncomingMessage) {
        message.metadata.attempt += 1;
        // The subscriber holds the receiver, so the queue is open
        let _ = self.queue.tx.send(message);
    }
}

#[async_trait::async_trait]
impl Subscriber for InMemorySubscriber {
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ConsumerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(topic = %self.topic, group = %self.group, "Starting in-memory consumption loop");

        loop {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = async {
                    let mut rx = self.queue.rx.lock().await;
                    rx.recv().await
                } => message,
            };

            match next {
                Some(message) => self.dispatch(handler.as_ref(), message).await,
                None => break,
            }
        }

        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
