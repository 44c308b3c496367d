use crate::config::{DatabaseConfig, StoreBackend};
use crate::image_store::{ImageRecord, ImageStore, InsertOutcome, NewImage, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Row shape in SQLite, where ids are stored as text
#[derive(FromRow)]
struct ImageRow {
    id: String,
    request_id: String,
    nickname: String,
    mime_type: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let parse = |value: &str| {
            Uuid::parse_str(value)
                .map_err(|e| StoreError::Corrupt(format!("bad id {:?}: {}", value, e)))
        };

        Ok(ImageRecord {
            id: parse(&row.id)?,
            request_id: parse(&row.request_id)?,
            nickname: row.nickname,
            mime_type: row.mime_type,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

/// Image store in SQLite
#[derive(Clone)]
pub struct SqliteImageStore {
    pool: SqlitePool,
}

impl SqliteImageStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        // Every connection to `:memory:` opens a separate database, so an
        // in-memory store keeps exactly one connection for its whole life.
        let pool = if config.url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout())
                .connect_with(options)
                .await?
        };

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Migrated in-memory store
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect(&DatabaseConfig::sqlite_in_memory()).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ImageStore for SqliteImageStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    #[instrument(skip(self, image), fields(request_id = %image.request_id, nickname = %image.nickname))]
    async fn insert(&self, image: NewImage) -> Result<InsertOutcome, StoreError> {
        let id = Uuid::new_v4();
        let request_id = image.request_id.to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO images (id, request_id, nickname, mime_type, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(&request_id)
        .bind(&image.nickname)
        .bind(&image.mime_type)
        .bind(&image.payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            debug!(image_id = %id, size = image.payload.len(), "Image inserted");
            return Ok(InsertOutcome::Inserted(id));
        }

        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM images WHERE request_id = ?")
            .bind(&request_id)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some((existing_id,)) => Uuid::parse_str(&existing_id)
                .map(InsertOutcome::AlreadyApplied)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Err(StoreError::Corrupt(format!(
                "insert for request {} conflicted but no row exists",
                request_id
            ))),
        }
    }

    async fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, request_id, nickname, mime_type, payload, created_at
            FROM images
            WHERE nickname = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(nickname)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, request_id, nickname, mime_type, payload, created_at
            FROM images
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ImageRecord::try_from).transpose()
    }

    async fn count_by_request(&self, request_id: Uuid) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images WHERE request_id = ?")
            .bind(request_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        debug!("SQLite migrations completed");
        Ok(())
    }
}
