//! Photo Pipeline - notification and dead-letter consumers
//!
//! This binary runs one of the observability-side consumers:
//! - `notify`: subscribes to ingest-completed events on a private consumer
//!   group and logs every uploaded image
//! - `dead-letters`: tails the dead letter topic for inspection

use anyhow::{Context, Result};
use photo_pipeline::prelude::*;
use photo_pipeline::DeadLetter;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Logs dead-lettered messages so operators can inspect them
struct DeadLetterInspector;

#[async_trait]
impl MessageHandler for DeadLetterInspector {
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        match serde_json::from_slice::<DeadLetter>(&message.payload) {
            Ok(dead) => {
                warn!(
                    id = %dead.id,
                    original_topic = %dead.original_topic,
                    original_offset = dead.original_offset,
                    original_key = ?dead.original_key,
                    attempts = dead.attempts,
                    size = dead.original_message.len(),
                    error = %dead.error,
                    "Dead letter"
                );
            }
            Err(e) => {
                error!(error = %e, offset = message.metadata.offset, "Unreadable dead letter");
            }
        }
        Disposition::Ack
    }
}

/// Run the upload notification consumer on its own consumer group
async fn run_notifier(config: KafkaConfig) -> Result<()> {
    let prefix =
        std::env::var("NOTIFIER_GROUP_PREFIX").unwrap_or_else(|_| "photo-notifier".to_string());
    // A private group per instance behaves like an exclusive auto-delete queue:
    // every instance sees every event, and only events published from now on.
    let group_id = format!("{}-{}", prefix, Uuid::new_v4());
    info!(group = %group_id, "Starting upload notification consumer");

    let subscriber = Arc::new(
        SubscriberBuilder::from_config(config.clone())
            .group_id(&group_id)
            .client_id("photo-notifier")
            .auto_offset_reset("latest")
            .build()?,
    );
    subscriber.subscribe_ingest_completed()?;

    let handler = Arc::new(NotificationHandler::new(&config.topics.uploaded_routing_key));
    run_until_shutdown(subscriber, handler).await
}

/// Run the dead letter inspector
async fn run_dead_letters(config: KafkaConfig) -> Result<()> {
    info!(topic = %config.topics.dead_letter_queue, "Starting dead letter inspector");

    let subscriber = Arc::new(
        SubscriberBuilder::from_config(config)
            .group_id("photo-dlq-inspector")
            .client_id("photo-dlq-inspector")
            .auto_offset_reset("earliest")
            .build()?,
    );
    subscriber.subscribe_dead_letters()?;

    run_until_shutdown(subscriber, Arc::new(DeadLetterInspector)).await
}

async fn run_until_shutdown(
    subscriber: Arc<KafkaSubscriber>,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    let signal_target = subscriber.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping consumer");
        }
        signal_target.shutdown();
    });

    subscriber.run(handler).await.context("Consumer failed")?;
    info!("Consumer stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rdkafka=warn")),
        )
        .with_target(false)
        .init();

    let config = KafkaConfig::from_env()?;
    config.validate()?;
    info!(brokers = %config.bootstrap_servers, "Photo pipeline consumer");

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("notify");

    match mode {
        "notify" => run_notifier(config).await?,
        "dead-letters" => run_dead_letters(config).await?,
        _ => {
            println!("Usage: pipeline [notify|dead-letters]");
            println!();
            println!("Modes:");
            println!("  notify       - Log every ingest-completed event (default)");
            println!("  dead-letters - Log messages routed to the dead letter topic");
            println!();
            println!("Environment variables:");
            println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
            println!("  KAFKA_CLIENT_ID         - Client ID (default: photo-pipeline)");
            println!("  KAFKA_SECURITY_PROTOCOL - plaintext, ssl, sasl_plaintext or sasl_ssl");
            println!("  KAFKA_SASL_MECHANISM, KAFKA_SASL_USERNAME, KAFKA_SASL_PASSWORD");
            println!("  KAFKA_SSL_CA_LOCATION   - CA bundle for TLS");
            println!("  KAFKA_MAX_DELIVERY_ATTEMPTS - Deliveries before dead-lettering (default: 5)");
            println!("  KAFKA_MAX_MESSAGE_BYTES - Largest record the producer sends (default: 25165824)");
            println!("  NOTIFIER_GROUP_PREFIX   - Consumer group prefix (default: photo-notifier)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use photo_pipeline::MessageMetadata;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_inspector_acks_everything() {
        let message = IncomingMessage {
            payload: b"not a dead letter".to_vec(),
            metadata: MessageMetadata {
                topic: "photo.dlq".to_string(),
                partition: 0,
                offset: 3,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
                attempt: 1,
            },
        };
        assert_eq!(DeadLetterInspector.handle(&message).await, Disposition::Ack);
    }
}
