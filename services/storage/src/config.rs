use photo_pipeline::KafkaConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage service settings, one section per concern
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Used as client id prefix and in logs
    #[serde(default = "default_service_name")]
    pub name: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which database implementation backs the image store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Sqlite,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Sqlite => "sqlite",
        }
    }
}

/// Image store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// `postgres://...` or `sqlite://...`
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply the bundled schema on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Read cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Use Redis at all; when false reads always go to the store
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Redis connection URL
    #[serde(default = "default_cache_url")]
    pub url: String,
    /// Prefix for every cache key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long to wait for Redis at startup
    #[serde(default = "default_cache_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on a single get, set or delete
    #[serde(default = "default_cache_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

/// Storage worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Consume ingest requests in this process
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upper bound on a single store insert
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

/// Query API listener
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Empty means any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_service_name() -> String {
    "storage-service".into()
}

fn default_log_level() -> String {
    "info,photo_storage=debug".into()
}

fn default_log_format() -> String {
    "json".into()
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_database_url() -> String {
    "postgres://localhost/photos".into()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_cache_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_key_prefix() -> String {
    "photo:image".into()
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_cache_connect_timeout_ms() -> u64 {
    2000
}

fn default_cache_op_timeout_ms() -> u64 {
    250
}

fn default_store_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8081
}

impl Config {
    /// Defaults, then `config/storage.*` and `/etc/photo/storage.*`, then
    /// `STORAGE__SECTION__KEY` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/photo/storage").required(false))
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject settings the service cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("database.url must be set");
        }
        let url_matches = match self.database.backend {
            StoreBackend::Postgres => {
                self.database.url.starts_with("postgres://")
                    || self.database.url.starts_with("postgresql://")
            }
            StoreBackend::Sqlite => self.database.url.starts_with("sqlite:"),
        };
        if !url_matches {
            anyhow::bail!(
                "database.url does not match backend {}",
                self.database.backend.as_str()
            );
        }
        if self.worker.store_timeout_ms == 0 {
            anyhow::bail!("worker.store_timeout_ms must be greater than 0");
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be greater than 0");
        }
        if self.cache.op_timeout_ms == 0 {
            anyhow::bail!("cache.op_timeout_ms must be greater than 0");
        }
        self.kafka.validate()?;
        Ok(())
    }

    /// Upper bound on a single store insert
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.store_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Single-connection in-memory SQLite, for tests and local runs
    pub fn sqlite_in_memory() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Self::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// `None` keeps idle connections forever
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_cache_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            connect_timeout_ms: default_cache_connect_timeout_ms(),
            op_timeout_ms: default_cache_op_timeout_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert_eq!(config.database.backend, StoreBackend::Postgres);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.kafka.consumer.group_id, "storage-workers");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_names() {
        let backend: StoreBackend = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(backend, StoreBackend::Sqlite);
        assert_eq!(StoreBackend::Postgres.as_str(), "postgres");
    }

    #[test]
    fn test_url_must_match_backend() {
        let mut config = Config::default();
        config.database.backend = StoreBackend::Sqlite;
        assert!(config.validate().is_err());

        config.database = DatabaseConfig::sqlite_in_memory();
        assert!(config.validate().is_ok());
    }
}
