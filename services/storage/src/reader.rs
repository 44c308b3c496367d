//! Cache-aside reads by nickname.
//!
//! Only one representative record (the oldest) is cached per nickname, so a
//! cache hit answers with a single entry even when the store holds several.
//! Use [`ImageReader::fetch_all_by_nickname`] when the complete set matters.

use crate::cache::{bounded, CacheEntry, ImageCache};
use crate::image_store::{ImagePayload, ImageRecord, ImageStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("No images stored for nickname {0}")]
    NotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct ImageReader {
    store: Arc<dyn ImageStore>,
    cache: Arc<dyn ImageCache>,
    cache_timeout: Duration,
}

impl ImageReader {
    pub fn new(store: Arc<dyn ImageStore>, cache: Arc<dyn ImageCache>) -> Self {
        Self {
            store,
            cache,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    /// A cache call that takes longer is treated as a miss
    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn ImageCache> {
        &self.cache
    }

    /// Cache first, then the store on a miss
    #[instrument(skip(self))]
    pub async fn fetch_by_nickname(&self, nickname: &str) -> Result<Vec<ImagePayload>, ReadError> {
        match bounded(self.cache_timeout, self.cache.get(nickname)).await {
            Ok(Some(entry)) => {
                metrics::counter!("storage.cache.hits").increment(1);
                debug!("Cache hit");
                return Ok(vec![entry.into()]);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, cache = self.cache.name(), "Cache read failed"),
        }

        metrics::counter!("storage.cache.misses").increment(1);
        self.load_from_store(nickname).await
    }

    /// Always reads the complete set from the store
    #[instrument(skip(self))]
    pub async fn fetch_all_by_nickname(
        &self,
        nickname: &str,
    ) -> Result<Vec<ImagePayload>, ReadError> {
        self.load_from_store(nickname).await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<ImageRecord, ReadError> {
        self.store
            .get(id)
            .await?
            .ok_or(ReadError::ImageNotFound(id))
    }

    async fn load_from_store(&self, nickname: &str) -> Result<Vec<ImagePayload>, ReadError> {
        let records = self.store.find_by_nickname(nickname).await?;

        let Some(first) = records.first() else {
            return Err(ReadError::NotFound(nickname.to_string()));
        };

        let entry = CacheEntry::from_record(first);
        if let Err(e) = bounded(self.cache_timeout, self.cache.set(nickname, &entry)).await {
            warn!(error = %e, cache = self.cache.name(), "Cache population failed");
        }

        Ok(records.into_iter().map(ImagePayload::from).collect())
    }
}
