//! Broker-independent message channel capabilities.
//!
//! Services never talk to a broker client directly. They are handed a
//! [`Publisher`] to emit messages and a [`Subscriber`] that drives a
//! [`MessageHandler`]. The handler reports a [`Disposition`] for every
//! delivery and the subscriber turns that into broker acknowledgement,
//! redelivery or dead-lettering.

use crate::messages::DeadLetter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Header carrying the logical message type
pub const MESSAGE_TYPE_HEADER: &str = "message-type";
/// Header carrying the correlation (request) identifier
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
/// Header carrying the routing key of topic-routed events
pub const ROUTING_KEY_HEADER: &str = "routing-key";

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer could not be created: {0}")]
    CreationError(String),

    #[error("message could not be encoded: {0}")]
    SerializationError(String),

    #[error("publish to {topic} failed: {message}")]
    SendError { topic: String, message: String },

    #[error("no delivery confirmation within {0:?}")]
    Timeout(Duration),

    #[error("broker connection is closed")]
    NotConnected,

    #[error("{size} byte message exceeds the size limit of {topic}")]
    MessageTooLarge { topic: String, size: usize },
}

impl ProducerError {
    /// Whether retrying the same publish may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ProducerError::SerializationError(_)
                | ProducerError::CreationError(_)
                | ProducerError::MessageTooLarge { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer could not be created: {0}")]
    CreationError(String),

    #[error("subscription failed: {0}")]
    SubscriptionError(String),

    #[error("offset commit failed: {0}")]
    CommitError(String),

    #[error("receive failed: {0}")]
    PollError(String),
}

/// Broker receipt for a published message
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// A message on its way to the broker
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key; messages sharing a key keep their order
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Encode `body` as JSON
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        body: &T,
    ) -> Result<Self, ProducerError> {
        serde_json::to_vec(body)
            .map(|payload| Self::new(topic, payload))
            .map_err(|e| ProducerError::SerializationError(e.to_string()))
    }

    pub fn with_key(self, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_HEADER, id)
    }

    pub fn with_message_type(self, message_type: impl Into<String>) -> Self {
        self.with_header(MESSAGE_TYPE_HEADER, message_type)
    }

    pub fn with_routing_key(self, routing_key: impl Into<String>) -> Self {
        self.with_header(ROUTING_KEY_HEADER, routing_key)
    }

    /// First header with the given name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Where a delivery came from and how often it has been handed out
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds since the epoch
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
}

/// One delivery handed to a [`MessageHandler`]
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// The partitioning key, if it is valid UTF-8
    pub fn key_str(&self) -> Option<String> {
        let key = self.metadata.key.as_deref()?;
        std::str::from_utf8(key).ok().map(str::to_owned)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(MESSAGE_TYPE_HEADER)
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.header(ROUTING_KEY_HEADER)
    }
}

/// What the subscriber should do with a delivery once the handler is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; acknowledge so the broker never redelivers it
    Ack,
    /// Not processed; leave unacknowledged so it is redelivered, up to the
    /// configured attempt bound
    Retry { reason: String },
    /// Can never be processed; dead-letter and acknowledge
    Reject { reason: String },
}

impl Disposition {
    pub fn retry(reason: impl Into<String>) -> Self {
        Disposition::Retry {
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Disposition::Reject {
            reason: reason.into(),
        }
    }

    /// Turn the handler's verdict on the given (1-based) attempt into the
    /// subscriber's next step
    pub fn settlement(self, attempt: u32, max_attempts: u32) -> Settlement {
        match self {
            Disposition::Ack => Settlement::Commit,
            Disposition::Retry { reason } if attempt < max_attempts => {
                Settlement::Redeliver { reason }
            }
            Disposition::Retry { reason } => Settlement::DeadLetter {
                reason: format!("gave up after {} attempts: {}", attempt, reason),
            },
            Disposition::Reject { reason } => Settlement::DeadLetter { reason },
        }
    }
}

/// Broker-side action for a settled delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge the delivery
    Commit,
    /// Hand the same message out again
    Redeliver { reason: String },
    /// Route to the dead letter topic, then acknowledge
    DeadLetter { reason: String },
}

impl Settlement {
    /// Step after a dead-letter hand-off. The original is acknowledged only
    /// once its dead letter is on the broker.
    pub fn after_dead_letter<T>(hand_off: &Result<T, ProducerError>, reason: &str) -> Settlement {
        match hand_off {
            Ok(_) => Settlement::Commit,
            Err(e) => Settlement::Redeliver {
                reason: format!("dead letter not published ({}): {}", e, reason),
            },
        }
    }
}

/// Publishing capability
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message and wait for the broker to confirm receipt
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError>;
}

/// Consumer-side processing of one delivery at a time
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Decide the fate of a delivery
    async fn handle(&self, message: &IncomingMessage) -> Disposition;

    /// Called once a message has been routed to the dead letter queue
    async fn on_dead_letter(&self, message: &IncomingMessage, reason: &str) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            attempt = message.metadata.attempt,
            reason = %reason,
            "Message dead-lettered"
        );
    }
}

/// Subscription capability: drives a handler until shut down
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Consume messages and dispatch them to the handler until shutdown
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ConsumerError>;

    /// Ask a running [`Subscriber::run`] to return
    fn shutdown(&self);
}

/// Route a message to the dead letter topic.
///
/// The caller must not acknowledge the original unless this succeeds.
pub async fn send_to_dlq(
    publisher: &dyn Publisher,
    dlq_topic: &str,
    message: &IncomingMessage,
    reason: &str,
) -> Result<DeliveryResult, ProducerError> {
    let dead_letter = DeadLetter::from_incoming(message, reason);
    let outgoing = OutgoingMessage::new_json(dlq_topic, &dead_letter)?
        .with_key(dead_letter.id.to_string())
        .with_message_type("dead_letter")
        .with_header("original-topic", message.metadata.topic.clone())
        .with_header("error-reason", reason);

    publisher.publish(outgoing).await.map_err(|e| {
        error!(
            error = %e,
            topic = %message.metadata.topic,
            offset = message.metadata.offset,
            "Failed to send to DLQ"
        );
        e
    })
}
