//! Durable image records.
//!
//! Records are insert-only. `request_id` is unique, which makes a redelivered
//! ingest request detectable at insert time, including across concurrent
//! worker instances.

use crate::config::{DatabaseConfig, StoreBackend};
use crate::postgres_store::PostgresImageStore;
use crate::sqlite_store::SqliteImageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// A stored image
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub nickname: String,
    pub mime_type: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// An image about to be stored for one ingest request
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub request_id: Uuid,
    pub nickname: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was committed under this id
    Inserted(Uuid),
    /// The request was stored before; this is the existing record's id
    AlreadyApplied(Uuid),
}

impl InsertOutcome {
    pub fn image_id(&self) -> Uuid {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::AlreadyApplied(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::AlreadyApplied(_))
    }
}

/// Payload and mime type as handed back to readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub payload: Vec<u8>,
}

impl From<ImageRecord> for ImagePayload {
    fn from(record: ImageRecord) -> Self {
        Self {
            mime_type: record.mime_type,
            payload: record.payload,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Backend this store runs on
    fn backend(&self) -> StoreBackend;

    /// Insert once per request id; a repeated request id reports the
    /// existing record instead of creating another one
    async fn insert(&self, image: NewImage) -> Result<InsertOutcome, StoreError>;

    /// All records with this nickname, oldest first
    async fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ImageRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError>;

    /// Number of records created for a request id (0 or 1)
    async fn count_by_request(&self, request_id: Uuid) -> Result<i64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    async fn run_migrations(&self) -> Result<(), StoreError>;
}

/// Connect the store implementation selected by `database.backend`
pub async fn connect_store(config: &DatabaseConfig) -> Result<Arc<dyn ImageStore>, StoreError> {
    let store: Arc<dyn ImageStore> = match config.backend {
        StoreBackend::Postgres => Arc::new(PostgresImageStore::connect(config).await?),
        StoreBackend::Sqlite => Arc::new(SqliteImageStore::connect(config).await?),
    };

    info!(backend = store.backend().as_str(), "Image store connected");

    if config.run_migrations {
        store.run_migrations().await?;
    }

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_reports_image_id() {
        let id = Uuid::new_v4();
        assert_eq!(InsertOutcome::Inserted(id).image_id(), id);
        assert_eq!(InsertOutcome::AlreadyApplied(id).image_id(), id);
        assert!(InsertOutcome::AlreadyApplied(id).is_duplicate());
        assert!(!InsertOutcome::Inserted(id).is_duplicate());
    }

    #[tokio::test]
    async fn test_connect_store_selects_sqlite() {
        let store = connect_store(&DatabaseConfig::sqlite_in_memory()).await.unwrap();
        assert_eq!(store.backend(), StoreBackend::Sqlite);
        store.health_check().await.unwrap();
        assert!(store.find_by_nickname("nobody").await.unwrap().is_empty());
    }
}
