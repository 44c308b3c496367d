//! Photo Ingest - upload ingress for the photo service
//!
//! Validates uploads, resolves their mime type and publishes one ingest
//! request per upload to the broker. Storage happens asynchronously in the
//! storage workers; callers get a request id back, not a stored image.
//!
//! ```text
//! HTTP upload -> IngressProducer -> photo.ingest.requests -> storage workers
//! ```

pub mod api;
pub mod config;
pub mod mime;
pub mod producer;

pub use config::IngestConfig;
pub use mime::resolve_mime_type;
pub use producer::{IngestError, IngressProducer, ProducerStats};
