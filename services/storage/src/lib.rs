//! Photo Storage Service
//!
//! Storage side of the asynchronous image ingestion pipeline. This service
//! consumes ingest requests from the broker, stores each image exactly once,
//! announces stored images, and serves them back by nickname.
//!
//! ## Features
//!
//! - **Ack-after-commit**: a delivery is acknowledged only once its record is
//!   durably stored; failures are redelivered and eventually dead-lettered
//! - **Idempotent inserts**: the request id is unique in the store, so
//!   redeliveries and competing workers never create a second record
//! - **Cache-aside reads**: Redis in front of the store, optional at runtime
//! - **Pluggable store**: PostgreSQL or SQLite behind one interface
//!
//! ## Architecture
//!
//! ```text
//! Kafka                       Store                      Kafka
//! ┌──────────────┐           ┌──────────────┐           ┌──────────────┐
//! │ Ingest       │──────────▶│ images       │──────────▶│ Images       │
//! │ Requests     │  Storage  │ (Postgres /  │  Storage  │ Uploaded     │
//! └──────────────┘  Worker   │  SQLite)     │  Worker   └──────────────┘
//!                            └──────────────┘
//!                                   ▲
//!                                   │ miss
//! ┌──────────────┐  hit      ┌──────────────┐
//! │ Query API    │──────────▶│ Redis cache  │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod image_store;
pub mod postgres_store;
pub mod reader;
pub mod sqlite_store;
pub mod worker;

pub use cache::{
    connect_cache, CacheEntry, CacheError, ImageCache, MemoryImageCache, NoopImageCache,
    RedisImageCache,
};
pub use config::{Config, StoreBackend};
pub use image_store::{
    connect_store, ImagePayload, ImageRecord, ImageStore, InsertOutcome, NewImage, StoreError,
};
pub use postgres_store::PostgresImageStore;
pub use reader::{ImageReader, ReadError};
pub use sqlite_store::SqliteImageStore;
pub use worker::StorageWorker;
