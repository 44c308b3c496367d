use crate::config::{DatabaseConfig, StoreBackend};
use crate::image_store::{ImageRecord, ImageStore, InsertOutcome, NewImage, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Image store in PostgreSQL
pub struct PostgresImageStore {
    pool: PgPool,
}

impl PostgresImageStore {
    /// Create a new store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ImageStore for PostgresImageStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }

    #[instrument(skip(self, image), fields(request_id = %image.request_id, nickname = %image.nickname))]
    async fn insert(&self, image: NewImage) -> Result<InsertOutcome, StoreError> {
        let id = Uuid::new_v4();

        let inserted = sqlx::query(
            r#"
            INSERT INTO images (id, request_id, nickname, mime_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(image.request_id)
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

        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM images WHERE request_id = $1")
                .bind(image.request_id)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((existing_id,)) => Ok(InsertOutcome::AlreadyApplied(existing_id)),
            None => Err(StoreError::Corrupt(format!(
                "insert for request {} conflicted but no row exists",
                image.request_id
            ))),
        }
    }

    async fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let records = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, request_id, nickname, mime_type, payload, created_at
            FROM images
            WHERE nickname = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(nickname)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, request_id, nickname, mime_type, payload, created_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_by_request(&self, request_id: Uuid) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images WHERE request_id = $1")
            .bind(request_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}
