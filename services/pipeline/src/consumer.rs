//! Kafka consumer wrapper for the ingestion channels.
//!
//! Offsets are committed only after the handler returns [`Disposition::Ack`]
//! or after the dead letter has been published, so a crash mid-processing
//! leads to redelivery, never to loss. A [`Disposition::Retry`] seeks the
//! partition back to the failed message after a backoff delay; the attempt
//! count is bounded by `delivery.max_delivery_attempts`. When the rewind
//! itself fails the message is handed to the handler again in place, so a
//! later commit can never skip it.

use crate::channel::{
    send_to_dlq, ConsumerError, Disposition, IncomingMessage, MessageHandler, MessageMetadata,
    ProducerError, Publisher, Settlement, Subscriber,
};
use crate::config::KafkaConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

type PartitionOffset = (String, i32, i64);

/// What the consume loop does once a delivery is settled
#[derive(Debug, PartialEq, Eq)]
enum Next {
    /// Receive the next message from the broker
    Receive,
    /// The partition could not be rewound; hand the same message out again
    Redispatch,
    /// Shutdown arrived during a redelivery backoff
    Stop,
}

/// The broker redelivers after a successful rewind. Otherwise the consumer
/// position is already past the message and it must be redispatched here.
fn after_rewind(rewind: Result<(), ConsumerError>) -> Next {
    match rewind {
        Ok(()) => Next::Receive,
        Err(e) => {
            error!(error = %e, "Failed to rewind partition, redelivering in place");
            Next::Redispatch
        }
    }
}

/// Kafka-backed [`Subscriber`]
pub struct KafkaSubscriber {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: broadcast::Sender<()>,
    dlq_publisher: Option<Arc<dyn Publisher>>,
}

impl KafkaSubscriber {
    /// Create a new consumer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
            dlq_publisher: None,
        })
    }

    /// Set the dead letter queue publisher
    pub fn with_dlq_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dlq_publisher = Some(publisher);
        self
    }

    /// Subscribe to the specified topics
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Subscribe to the durable ingest request topic
    pub fn subscribe_ingest_requests(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.ingest_requests.as_str()])
    }

    /// Subscribe to ingest-completed events
    pub fn subscribe_ingest_completed(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.ingest_completed.as_str()])
    }

    /// Subscribe to the dead letter topic
    pub fn subscribe_dead_letters(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.dead_letter_queue.as_str()])
    }

    /// Commit the offset following the given message
    fn commit_message(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset + 1),
            )
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    /// Rewind the partition so the broker hands the message out again
    fn seek_back(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        self.consumer
            .seek(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .map_err(|e| ConsumerError::PollError(e.to_string()))
    }

    async fn dead_letter(
        &self,
        handler: &dyn MessageHandler,
        message: &IncomingMessage,
        reason: &str,
    ) -> Result<(), ProducerError> {
        match self.dlq_publisher {
            Some(ref dlq) => {
                send_to_dlq(
                    dlq.as_ref(),
                    &self.config.topics.dead_letter_queue,
                    message,
                    reason,
                )
                .await?;
            }
            None => error!(
                offset = message.metadata.offset,
                "No DLQ publisher configured, dropping message"
            ),
        }
        handler.on_dead_letter(message, reason).await;
        Ok(())
    }

    fn acknowledge(&self, metadata: &MessageMetadata, attempts: &mut HashMap<PartitionOffset, u32>) {
        attempts.remove(&(metadata.topic.clone(), metadata.partition, metadata.offset));
        if let Err(e) = self.commit_message(metadata) {
            warn!(error = %e, offset = metadata.offset, "Failed to commit offset");
        }
    }

    /// Leave the offset uncommitted, wait out the backoff and rewind
    async fn redeliver(
        &self,
        metadata: &MessageMetadata,
        reason: &str,
        attempts: &mut HashMap<PartitionOffset, u32>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Next {
        attempts.insert(
            (metadata.topic.clone(), metadata.partition, metadata.offset),
            metadata.attempt,
        );
        let delay = self.config.redelivery_delay(metadata.attempt);
        warn!(
            offset = metadata.offset,
            attempt = metadata.attempt,
            max_attempts = self.config.delivery.max_delivery_attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Leaving message unacknowledged for redelivery"
        );

        tokio::select! {
            _ = shutdown_rx.recv() => return Next::Stop,
            _ = tokio::time::sleep(delay) => {}
        }

        after_rewind(self.seek_back(metadata))
    }

    /// Apply the handler's disposition to the broker
    async fn settle(
        &self,
        handler: &dyn MessageHandler,
        message: &IncomingMessage,
        disposition: Disposition,
        attempts: &mut HashMap<PartitionOffset, u32>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Next {
        let metadata = &message.metadata;
        let max_attempts = self.config.delivery.max_delivery_attempts;

        match disposition.settlement(metadata.attempt, max_attempts) {
            Settlement::Commit => {
                self.acknowledge(metadata, attempts);
                Next::Receive
            }
            Settlement::Redeliver { reason } => {
                self.redeliver(metadata, &reason, attempts, shutdown_rx).await
            }
            Settlement::DeadLetter { reason } => {
                let hand_off = self.dead_letter(handler, message, &reason).await;
                match Settlement::after_dead_letter(&hand_off, &reason) {
                    Settlement::Redeliver { reason } => {
                        self.redeliver(metadata, &reason, attempts, shutdown_rx).await
                    }
                    _ => {
                        self.acknowledge(metadata, attempts);
                        Next::Receive
                    }
                }
            }
        }
    }

    /// Convert a borrowed Kafka message to our IncomingMessage type
    fn convert_message<M: KafkaMessage>(msg: &M, attempt: u32) -> IncomingMessage {
        let payload = msg.payload().unwrap_or(&[]).to_vec();
        let key = msg.key().map(|k| k.to_vec());

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
                timestamp: msg.timestamp().to_millis(),
                headers,
                attempt,
            },
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for KafkaSubscriber {
    #[instrument(skip(self, handler), fields(group = %self.config.consumer.group_id))]
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ConsumerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempts: HashMap<PartitionOffset, u32> = HashMap::new();
        let mut redispatch: Option<IncomingMessage> = None;

        info!("Starting message consumption loop");

        loop {
            let incoming = if let Some(mut message) = redispatch.take() {
                message.metadata.attempt += 1;
                message
            } else {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                    message_result = self.consumer.recv() => match message_result {
                        Ok(borrowed) => {
                            let position = (
                                borrowed.topic().to_string(),
                                borrowed.partition(),
                                borrowed.offset(),
                            );
                            let attempt = attempts.get(&position).copied().unwrap_or(0) + 1;
                            Self::convert_message(&borrowed, attempt)
                        }
                        Err(e) => {
                            error!(error = %e, "Kafka error");
                            continue;
                        }
                    },
                }
            };

            debug!(
                topic = %incoming.metadata.topic,
                partition = incoming.metadata.partition,
                offset = incoming.metadata.offset,
                attempt = incoming.metadata.attempt,
                "Received message"
            );

            let disposition = handler.handle(&incoming).await;
            let next = self
                .settle(
                    handler.as_ref(),
                    &incoming,
                    disposition,
                    &mut attempts,
                    &mut shutdown_rx,
                )
                .await;
            match next {
                Next::Receive => {}
                Next::Redispatch => redispatch = Some(incoming),
                Next::Stop => {
                    info!("Shutdown during redelivery backoff");
                    break;
                }
            }
        }

        // Only settled offsets are committed. The consumer position may be
        // past a message still waiting for redelivery, so it is never
        // committed wholesale.
        info!("Message consumption loop stopped");

        Ok(())
    }

    fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }
}

/// Builder for creating consumers with custom settings
pub struct SubscriberBuilder {
    config: KafkaConfig,
    dlq_publisher: Option<Arc<dyn Publisher>>,
}

impl SubscriberBuilder {
    /// Start from an existing configuration
    pub fn from_config(config: KafkaConfig) -> Self {
        Self {
            config,
            dlq_publisher: None,
        }
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.consumer.group_id = group_id.into();
        self
    }

    /// Set the client ID
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set auto offset reset behavior
    pub fn auto_offset_reset(mut self, reset: impl Into<String>) -> Self {
        self.config.consumer.auto_offset_reset = reset.into();
        self
    }

    /// Set the dead letter queue publisher
    pub fn with_dlq_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dlq_publisher = Some(publisher);
        self
    }

    /// Build the consumer; offsets are always committed manually
    pub fn build(mut self) -> Result<KafkaSubscriber, ConsumerError> {
        self.config.consumer.enable_auto_commit = false;
        let mut subscriber = KafkaSubscriber::new(self.config)?;
        if let Some(dlq) = self.dlq_publisher {
            subscriber = subscriber.with_dlq_publisher(dlq);
        }
        Ok(subscriber)
    }
}
