//! Read-through cache keyed by nickname.
//!
//! Entries are hints. Every implementation may miss at any time, and callers
//! treat a cache failure exactly like a miss.

use crate::config::CacheConfig;
use crate::image_store::{ImagePayload, ImageRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt cache entry for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// Run one cache operation with an upper bound. Running out of time counts
/// as the cache being unavailable.
pub async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| CacheError::Unavailable(format!("no reply within {:?}", limit)))?
}

/// One cached image, stored as `{mime_type, payload: base64}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl CacheEntry {
    pub fn from_record(record: &ImageRecord) -> Self {
        Self {
            mime_type: record.mime_type.clone(),
            payload: record.payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl From<CacheEntry> for ImagePayload {
    fn from(entry: CacheEntry) -> Self {
        Self {
            mime_type: entry.mime_type,
            payload: entry.payload,
        }
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Short name for logs and the readiness report
    fn name(&self) -> &'static str;

    async fn get(&self, nickname: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, nickname: &str, entry: &CacheEntry) -> Result<(), CacheError>;

    async fn invalidate(&self, nickname: &str) -> Result<(), CacheError>;
}

/// Redis cache with per-entry expiry
pub struct RedisImageCache {
    manager: ConnectionManager,
    key_prefix: String,
    ttl_secs: u64,
}

impl RedisImageCache {
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = Client::open(config.url.as_str())?;
        let manager = tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CacheError::Unavailable(format!(
                    "no connection to {} within {:?}",
                    config.url,
                    config.connect_timeout()
                ))
            })??;

        info!(url = %config.url, ttl_secs = config.ttl_secs, "Connected to Redis");

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            ttl_secs: config.ttl_secs,
        })
    }

    fn key(&self, nickname: &str) -> String {
        format!("{}:{}", self.key_prefix, nickname)
    }
}

#[async_trait]
impl ImageCache for RedisImageCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, nickname: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = self.key(nickname);
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(&key).await?;

        match raw {
            Some(raw) => CacheEntry::decode(&raw)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn set(&self, nickname: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let key = self.key(nickname);
        let value = entry.encode().map_err(|e| CacheError::Corrupt {
            key: key.clone(),
            message: e.to_string(),
        })?;

        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(&key, value, self.ttl_secs).await?;
        debug!(key = %key, ttl_secs = self.ttl_secs, "Cache entry written");
        Ok(())
    }

    async fn invalidate(&self, nickname: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.key(nickname)).await?;
        Ok(())
    }
}

/// Cache that never holds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopImageCache;

#[async_trait]
impl ImageCache for NoopImageCache {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn get(&self, _nickname: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _nickname: &str, _entry: &CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _nickname: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Accepts calls and never answers them
#[cfg(test)]
pub(crate) struct StalledCache;

#[cfg(test)]
#[async_trait]
impl ImageCache for StalledCache {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn get(&self, _nickname: &str) -> Result<Option<CacheEntry>, CacheError> {
        std::future::pending().await
    }

    async fn set(&self, _nickname: &str, _entry: &CacheEntry) -> Result<(), CacheError> {
        std::future::pending().await
    }

    async fn invalidate(&self, _nickname: &str) -> Result<(), CacheError> {
        std::future::pending().await
    }
}

/// Process-local cache without expiry, for single-process runs and tests
#[derive(Debug, Default)]
pub struct MemoryImageCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ImageCache for MemoryImageCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, nickname: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(nickname).cloned())
    }

    async fn set(&self, nickname: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(nickname.to_string(), entry.clone());
        Ok(())
    }

    async fn invalidate(&self, nickname: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(nickname);
        Ok(())
    }
}

/// Build the cache selected by config. An unreachable Redis leaves the
/// service running without a cache.
pub async fn connect_cache(config: &CacheConfig) -> Arc<dyn ImageCache> {
    if !config.enabled {
        info!("Cache disabled, reads go straight to the store");
        return Arc::new(NoopImageCache);
    }

    match RedisImageCache::connect(config).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(error = %e, "Redis is not reachable, running without a cache");
            Arc::new(NoopImageCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encoding_is_binary_safe() {
        let entry = CacheEntry {
            mime_type: "image/png".to_string(),
            payload: vec![0x89, 0x50, 0x00, 0xff, 0x0a],
        };

        let raw = entry.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["mime_type"], "image/png");
        assert_eq!(value["payload"], BASE64.encode([0x89, 0x50, 0x00, 0xff, 0x0a]));
        assert_eq!(CacheEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn test_entry_with_bad_base64_is_rejected() {
        assert!(CacheEntry::decode(r#"{"mime_type":"image/png","payload":"***"}"#).is_err());
    }

    #[tokio::test]
    async fn test_memory_cache_set_get_invalidate() {
        let cache = MemoryImageCache::new();
        let entry = CacheEntry {
            mime_type: "image/jpeg".to_string(),
            payload: b"jpeg".to_vec(),
        };

        assert!(cache.get("alice").await.unwrap().is_none());
        cache.set("alice", &entry).await.unwrap();
        assert_eq!(cache.get("alice").await.unwrap(), Some(entry));

        cache.invalidate("alice").await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_noop_cache_always_misses() {
        let cache = NoopImageCache;
        let entry = CacheEntry {
            mime_type: "image/png".to_string(),
            payload: vec![1],
        };
        cache.set("alice", &entry).await.unwrap();
        assert!(cache.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bounded_turns_a_stalled_call_into_unavailable() {
        let stalled = std::future::pending::<Result<(), CacheError>>();
        let result = bounded(Duration::from_millis(20), stalled).await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));

        let quick = bounded(Duration::from_millis(20), async { Ok(7) }).await;
        assert_eq!(quick.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_noop() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(connect_cache(&config).await.name(), "noop");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_to_noop() {
        let config = CacheConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            ..Default::default()
        };
        assert_eq!(connect_cache(&config).await.name(), "noop");
    }
}
