//! Ingest service settings: broker, upload API, publish policy and logs.

use config::{Config, ConfigError, Environment, File};
use photo_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Room for the JSON fields and headers around the base64 image
const REQUEST_ENVELOPE_BYTES: usize = 1024;

/// Largest ingest request an upload body of `upload_bytes` can encode to
pub fn encoded_request_bytes(upload_bytes: usize) -> usize {
    4 * upload_bytes.div_ceil(3) + REQUEST_ENVELOPE_BYTES
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestConfig {
    /// Broker connection and topic names
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// HTTP upload API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Publish retry policy
    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP upload API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default)]
    pub cors_enabled: bool,
}

/// Bounds on how long an upload may wait for broker confirmation.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Total time budget for a publish, retries included
    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,

    /// Time allowed for a single publish attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_publish_timeout_ms() -> u64 {
    5000
}
fn default_attempt_timeout_ms() -> u64 {
    2000
}
fn default_initial_interval_ms() -> u64 {
    100
}
fn default_max_interval_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info,photo_ingest=debug".into()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_enabled: false,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_publish_timeout_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl IngestConfig {
    /// Later sources override earlier ones:
    /// 1. `config/ingest` (optional)
    /// 2. `config/ingest-{RUN_MODE}` (optional)
    /// 3. Environment variables such as `INGEST__KAFKA__BOOTSTRAP_SERVERS`
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name(&format!("config/ingest-{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.topics.ingest_requests.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.topics.ingest_requests".to_string(),
            ));
        }

        if self.api.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let encoded = encoded_request_bytes(self.api.max_upload_bytes);
        if encoded > self.kafka.delivery.max_message_bytes {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: format!(
                    "encodes to {} bytes, above kafka.delivery.max_message_bytes ({})",
                    encoded, self.kafka.delivery.max_message_bytes
                ),
            });
        }

        if self.publish.attempt_timeout_ms == 0
            || self.publish.attempt_timeout_ms > self.publish.timeout_ms
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "publish.attempt_timeout_ms".to_string(),
                message: "must be between 1 and publish.timeout_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl PublishConfig {
    /// Policy that gives up after `total`, with short retry intervals
    pub fn with_budget(total: Duration) -> Self {
        let total_ms = total.as_millis() as u64;
        Self {
            timeout_ms: total_ms,
            attempt_timeout_ms: (total_ms / 2).max(1),
            initial_interval_ms: 10,
            max_interval_ms: 50,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("{0} must be set")]
    MissingField(String),

    #[error("{field} {message}")]
    InvalidValue { field: String, message: String },
}
