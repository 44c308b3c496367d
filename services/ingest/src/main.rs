//! Upload ingress service for the photo pipeline.
//!
//! Accepts multipart uploads over HTTP and publishes them as ingest requests.
//!
//! Settings come from `config/ingest*.toml` and `INGEST__*` environment
//! variables, see [`photo_ingest::config`].

use anyhow::Context;
use photo_ingest::api::{self, AppState};
use photo_ingest::config::{IngestConfig, LoggingConfig};
use photo_ingest::IngressProducer;
use photo_pipeline::ProducerBuilder;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::load().context("Failed to load configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = "photo-ingest",
        version = env!("CARGO_PKG_VERSION"),
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.topics.ingest_requests,
        "Starting upload ingress service"
    );

    config.validate()?;

    let publisher = ProducerBuilder::from_config(config.kafka.clone())
        .client_id("photo-ingest")
        .request_timeout(config.publish.attempt_timeout())
        .build()
        .context("Failed to create Kafka producer")?;

    let producer = IngressProducer::new(Arc::new(publisher), &config.kafka.topics.ingest_requests)
        .with_publish_policy(config.publish.clone())
        .with_max_message_bytes(config.kafka.delivery.max_message_bytes);
    let state = AppState {
        producer: Arc::new(producer),
    };

    if let Err(e) = api::start_api_server(state.clone(), &config.api, shutdown_signal()).await {
        error!(error = %e, "Ingest service failed");
        return Err(e);
    }

    let stats = state.producer.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        broker_failures = stats.broker_failures,
        "Shutdown complete"
    );
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level directive: {}", config.level))?,
    }
    .add_directive("rdkafka=warn".parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    match config.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().json()).init(),
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal, draining in-flight uploads");
}
