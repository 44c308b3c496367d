use anyhow::{Context, Result};
use photo_pipeline::{ProducerBuilder, Publisher, Subscriber, SubscriberBuilder};
use photo_storage::api::{start_api_server, AppState};
use photo_storage::{connect_cache, connect_store, Config, ImageReader, StorageWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        backend = config.database.backend.as_str(),
        "Starting photo storage service"
    );

    config.validate()?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = connect_store(&config.database)
        .await
        .context("Failed to initialize image store")?;
    let cache = connect_cache(&config.cache).await;

    let publisher = Arc::new(
        ProducerBuilder::from_config(config.kafka.clone())
            .client_id(format!("{}-producer", config.service.name))
            .build()
            .context("Failed to create Kafka producer")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn storage worker task
    let worker_handle = if config.worker.enabled {
        let subscriber = Arc::new(
            SubscriberBuilder::from_config(config.kafka.clone())
                .client_id(format!("{}-worker", config.service.name))
                .with_dlq_publisher(publisher.clone() as Arc<dyn Publisher>)
                .build()
                .context("Failed to create Kafka consumer")?,
        );
        subscriber
            .subscribe_ingest_requests()
            .context("Failed to subscribe to ingest requests")?;

        let worker = StorageWorker::new(
            store.clone(),
            cache.clone(),
            publisher.clone(),
            &config.kafka.topics,
        )
        .with_store_timeout(config.store_timeout())
        .with_cache_timeout(config.cache.op_timeout());

        let runner = subscriber.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.run(Arc::new(worker)).await {
                error!(error = %e, "Storage worker stopped with error");
            }
        });
        Some((subscriber, handle))
    } else {
        info!("Storage worker disabled, serving queries only");
        None
    };

    // Spawn API server task
    let api_state = AppState {
        reader: Arc::new(
            ImageReader::new(store, cache).with_cache_timeout(config.cache.op_timeout()),
        ),
    };
    let api_config = config.api.clone();
    let mut api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = api_shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Storage service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage service");

    // Stop taking deliveries first so nothing is left half handled
    if let Some((subscriber, handle)) = worker_handle {
        subscriber.shutdown();
        if let Err(e) = handle.await {
            error!(error = %e, "Storage worker task failed");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    if let Err(e) = publisher.flush(Duration::from_secs(5)) {
        error!(error = %e, "Failed to flush pending completion events");
    }

    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
