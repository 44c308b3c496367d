use crate::config::ApiConfig;
use crate::image_store::{ImagePayload, ImageRecord};
use crate::reader::{ImageReader, ReadError};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// State shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<ImageReader>,
}

/// One image as returned by the nickname query
#[derive(Debug, Serialize)]
pub struct ImageResponse {
    /// Base64 encoded payload
    pub image_data: String,
    pub mime_type: String,
}

impl From<ImagePayload> for ImageResponse {
    fn from(image: ImagePayload) -> Self {
        Self {
            image_data: BASE64.encode(&image.payload),
            mime_type: image.mime_type,
        }
    }
}

/// A stored record looked up by id
#[derive(Debug, Serialize)]
pub struct ImageDetailResponse {
    pub id: Uuid,
    pub request_id: Uuid,
    pub nickname: String,
    pub mime_type: String,
    pub image_data: String,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
}

impl From<ImageRecord> for ImageDetailResponse {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.id,
            request_id: record.request_id,
            nickname: record.nickname,
            mime_type: record.mime_type,
            image_data: BASE64.encode(&record.payload),
            size_bytes: record.payload.len(),
            created_at: record.created_at,
        }
    }
}

/// Query parameters for the nickname lookup
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    /// Read every stored record instead of trusting the cache
    #[serde(default)]
    pub complete: bool,
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<ReadError> for ApiError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::NotFound(_) | ReadError::ImageNotFound(_) => {
                api_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            ReadError::Store(ref inner) => {
                error!(error = %inner, "Image query failed");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "query_error",
                    "Failed to query images",
                )
            }
        }
    }
}

/// Query routes
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/backend", get(backend_info))
        .route("/api/v1/images/:nickname", get(get_images))
        .route("/api/v1/images/id/:image_id", get(get_image))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storage-service"
    }))
}

/// Readiness check: the store answers a trivial query
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.reader.store().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Which store and cache this instance runs on
async fn backend_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "backend": state.reader.store().backend().as_str(),
        "cache": state.reader.cache().name(),
    }))
}

/// Images stored under a nickname
#[instrument(skip(state))]
async fn get_images(
    State(state): State<AppState>,
    Path(nickname): Path<String>,
    Query(params): Query<ImageQuery>,
) -> Result<Json<Vec<ImageResponse>>, ApiError> {
    let nickname = nickname.trim();

    let images = if params.complete {
        state.reader.fetch_all_by_nickname(nickname).await?
    } else {
        state.reader.fetch_by_nickname(nickname).await?
    };

    Ok(Json(images.into_iter().map(ImageResponse::from).collect()))
}

/// Single image by id
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<ImageDetailResponse>, ApiError> {
    let record = state.reader.get_by_id(image_id).await?;
    Ok(Json(record.into()))
}

/// Start the query API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryImageCache;
    use crate::image_store::{ImageStore, NewImage};
    use crate::sqlite_store::SqliteImageStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn setup() -> (Router, Arc<SqliteImageStore>) {
        let store = Arc::new(SqliteImageStore::in_memory().await.unwrap());
        let reader = ImageReader::new(store.clone(), Arc::new(MemoryImageCache::new()));
        let router = create_router(
            AppState {
                reader: Arc::new(reader),
            },
            &ApiConfig::default(),
        );
        (router, store)
    }

    async fn store_image(store: &SqliteImageStore, nickname: &str, payload: &[u8]) -> Uuid {
        store
            .insert(NewImage {
                request_id: Uuid::new_v4(),
                nickname: nickname.to_string(),
                mime_type: "image/png".to_string(),
                payload: payload.to_vec(),
            })
            .await
            .unwrap()
            .image_id()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_images_by_nickname() {
        let (router, store) = setup().await;
        store_image(&store, "alice", b"\x89PNG").await;

        let response = router.oneshot(get("/api/v1/images/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json[0]["mime_type"], "image/png");
        assert_eq!(json[0]["image_data"], BASE64.encode(b"\x89PNG"));
    }

    #[tokio::test]
    async fn test_unknown_nickname_is_not_found() {
        let (router, _store) = setup().await;

        let response = router.oneshot(get("/api/v1/images/nobody")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn test_complete_query_returns_every_record() {
        let (router, store) = setup().await;
        store_image(&store, "bob", b"one").await;
        store_image(&store, "bob", b"two").await;

        // Warm the cache with a single representative entry
        let response = router
            .clone()
            .oneshot(get("/api/v1/images/bob"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

        let cached = router
            .clone()
            .oneshot(get("/api/v1/images/bob"))
            .await
            .unwrap();
        assert_eq!(json_body(cached).await.as_array().unwrap().len(), 1);

        let complete = router
            .oneshot(get("/api/v1/images/bob?complete=true"))
            .await
            .unwrap();
        assert_eq!(json_body(complete).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_image_by_id() {
        let (router, store) = setup().await;
        let id = store_image(&store, "carol", b"gif").await;

        let response = router
            .clone()
            .oneshot(get(&format!("/api/v1/images/id/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["nickname"], "carol");
        assert_eq!(json["size_bytes"], 3);

        let missing = router
            .oneshot(get(&format!("/api/v1/images/id/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ready_and_backend() {
        let (router, _store) = setup().await;

        let ready = router.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        let backend = router.oneshot(get("/api/v1/backend")).await.unwrap();
        let json = json_body(backend).await;
        assert_eq!(json["backend"], "sqlite");
        assert_eq!(json["cache"], "memory");
    }
}
