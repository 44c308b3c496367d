//! Kafka configuration for the photo ingestion channels.
//!
//! One `KafkaConfig` is shared by every service. It names the broker, the
//! delivery guarantees for publishing and redelivery, the consumer group
//! and the three topics (ingest requests, upload notifications, dead letters).

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker authentication and transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// librdkafka `security.protocol` (plaintext, ssl, sasl_plaintext, sasl_ssl)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// SASL mechanism, e.g. PLAIN or SCRAM-SHA-512
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// CA bundle for TLS connections
    #[serde(default)]
    pub ssl_ca_location: Option<String>,
}

fn default_protocol() -> String {
    "plaintext".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }
}

impl SecurityConfig {
    fn uses_sasl(&self) -> bool {
        self.protocol.to_lowercase().starts_with("sasl")
    }
}

/// Publish confirmation and redelivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Idempotent producer, so internal retries never duplicate a message
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// How long a publish may wait for its delivery report
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// none, gzip, snappy, lz4 or zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Deliveries of one message before it is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// First redelivery delay in milliseconds, doubled per attempt
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
    /// Upper bound on the redelivery delay in milliseconds
    #[serde(default = "default_redelivery_max_backoff_ms")]
    pub redelivery_max_backoff_ms: u64,
    /// Largest record the producer will send. The broker's `message.max.bytes`
    /// (or the topic's `max.message.bytes`) must be at least this large.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_redelivery_backoff_ms() -> u64 {
    500
}

fn default_redelivery_max_backoff_ms() -> u64 {
    30000
}

fn default_max_message_bytes() -> usize {
    24 * 1024 * 1024
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            enable_idempotence: true,
            request_timeout_ms: default_request_timeout_ms(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            max_delivery_attempts: default_max_delivery_attempts(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            redelivery_max_backoff_ms: default_redelivery_max_backoff_ms(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// Consumer group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// earliest, latest or none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Always forced off by the subscriber builder
    #[serde(default)]
    pub enable_auto_commit: bool,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Upper bound on handling one delivery, redelivery waits included
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "storage-workers".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            enable_auto_commit: false,
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Topic names for the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Durable topic carrying ingest requests to the storage workers
    #[serde(default = "default_ingest_requests_topic")]
    pub ingest_requests: String,
    /// Topic carrying ingest-completed events
    #[serde(default = "default_ingest_completed_topic")]
    pub ingest_completed: String,
    /// Routing key stamped on ingest-completed events
    #[serde(default = "default_uploaded_routing_key")]
    pub uploaded_routing_key: String,
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_ingest_requests_topic() -> String {
    "photo.ingest.requests".to_string()
}

fn default_ingest_completed_topic() -> String {
    "photo.images.uploaded".to_string()
}

fn default_uploaded_routing_key() -> String {
    "image.uploaded".to_string()
}

fn default_dlq_topic() -> String {
    "photo.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            ingest_requests: default_ingest_requests_topic(),
            ingest_completed: default_ingest_completed_topic(),
            uploaded_routing_key: default_uploaded_routing_key(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Kafka configuration shared by the ingest, storage and notifier services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Raw librdkafka properties applied last
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "photo-pipeline".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security: SecurityConfig::default(),
            delivery: DeliveryConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Read `KAFKA_*` environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config =
            Self::new(env_string("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(default_bootstrap_servers));

        if let Some(client_id) = env_string("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = env_string("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Some(protocol) = env_string("KAFKA_SECURITY_PROTOCOL") {
            config.security.protocol = protocol.to_lowercase();
        }
        config.security.sasl_mechanism = env_string("KAFKA_SASL_MECHANISM");
        config.security.sasl_username = env_string("KAFKA_SASL_USERNAME");
        config.security.sasl_password = env_string("KAFKA_SASL_PASSWORD");
        config.security.ssl_ca_location = env_string("KAFKA_SSL_CA_LOCATION");

        if let Some(attempts) = env_string("KAFKA_MAX_DELIVERY_ATTEMPTS") {
            config.delivery.max_delivery_attempts =
                attempts.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "KAFKA_MAX_DELIVERY_ATTEMPTS".to_string(),
                    message: format!("not a number: {}", attempts),
                })?;
        }

        if let Some(bytes) = env_string("KAFKA_MAX_MESSAGE_BYTES") {
            config.delivery.max_message_bytes =
                bytes.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "KAFKA_MAX_MESSAGE_BYTES".to_string(),
                    message: format!("not a number: {}", bytes),
                })?;
        }

        Ok(config)
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", &self.security.protocol);

        if let Some(ref ca) = self.security.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref mechanism) = self.security.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let (Some(ref username), Some(ref password)) =
            (&self.security.sasl_username, &self.security.sasl_password)
        {
            config
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Producer settings: every publish waits for a confirmed delivery report
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("acks", &self.delivery.acks)
            .set("enable.idempotence", self.delivery.enable_idempotence.to_string())
            .set("request.timeout.ms", self.delivery.request_timeout_ms.to_string())
            .set("message.timeout.ms", self.delivery.request_timeout_ms.to_string())
            .set("linger.ms", self.delivery.linger_ms.to_string())
            .set("compression.type", &self.delivery.compression_type)
            .set("message.max.bytes", self.delivery.max_message_bytes.to_string());
        config
    }

    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", &self.consumer.group_id)
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set("enable.auto.commit", self.consumer.enable_auto_commit.to_string())
            .set("session.timeout.ms", self.consumer.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.consumer.max_poll_interval_ms.to_string());
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.request_timeout_ms)
    }

    /// Delay before redelivering a message on its given (1-based) attempt
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .delivery
            .redelivery_backoff_ms
            .saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.delivery.redelivery_max_backoff_ms))
    }

    /// Copy of this configuration joined to another consumer group
    pub fn with_group_id(&self, group_id: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.consumer.group_id = group_id.into();
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }
        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }
        if self.delivery.max_delivery_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "delivery.max_delivery_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        // librdkafka refuses message.max.bytes outside 1000..=1_000_000_000
        if !(1000..=1_000_000_000).contains(&self.delivery.max_message_bytes) {
            return Err(ConfigError::InvalidValue {
                key: "delivery.max_message_bytes".to_string(),
                message: "must be between 1000 and 1000000000".to_string(),
            });
        }
        if self.topics.ingest_requests == self.topics.dead_letter_queue {
            return Err(ConfigError::InvalidValue {
                key: "topics.dead_letter_queue".to_string(),
                message: "must differ from topics.ingest_requests".to_string(),
            });
        }
        if self.security.uses_sasl() && self.security.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "security.sasl_username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}
