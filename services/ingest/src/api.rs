use crate::config::ApiConfig;
use crate::mime;
use crate::producer::{IngestError, IngressProducer};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// State shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<IngressProducer>,
}

/// Upload accepted for asynchronous storage
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub request_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SniffResponse {
    pub mime_type: String,
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

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(_) => api_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
            IngestError::BrokerUnavailable(_) => {
                api_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", e.to_string())
            }
            IngestError::TooLarge(_) => {
                api_error(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", e.to_string())
            }
            IngestError::Encoding(_) => {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "encoding_error", e.to_string())
            }
        }
    }
}

/// Fields collected from an upload form
#[derive(Debug, Default)]
struct UploadForm {
    nickname: String,
    mime_type: Option<String>,
    file_content_type: Option<String>,
    image_data: Vec<u8>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "nickname" => {
                    form.nickname = field.text().await.map_err(|e| {
                        api_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text())
                    })?;
                }
                "mime_type" => {
                    let value = field.text().await.map_err(|e| {
                        api_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text())
                    })?;
                    form.mime_type = Some(value).filter(|v| !v.trim().is_empty());
                }
                "image_data" => {
                    form.file_content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await.map_err(|e| {
                        api_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text())
                    })?;
                    form.image_data = bytes.to_vec();
                }
                other => warn!(field = %other, "Ignoring unknown form field"),
            }
        }

        Ok(form)
    }

    /// The explicit form field wins over the file part's content type
    fn mime_hint(&self) -> Option<&str> {
        self.mime_type
            .as_deref()
            .or(self.file_content_type.as_deref())
    }
}

/// Upload routes
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/images", post(upload_image))
        .route("/api/v1/sniff-mime", post(sniff_mime))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photo-ingest",
        "stats": state.producer.stats(),
    }))
}

/// Accept an upload; storage happens asynchronously
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let form = UploadForm::read(multipart).await?;
    let hint = form.mime_hint().map(str::to_string);

    let request_id = state
        .producer
        .submit(&form.nickname, hint.as_deref(), form.image_data)
        .await
        .map_err(|e| {
            if e.is_retryable() {
                error!(error = %e, "Upload could not be handed to the broker");
            }
            ApiError::from(e)
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            request_id,
            status: "accepted",
        }),
    ))
}

/// Report the mime type the upload path would assign from content alone
async fn sniff_mime(multipart: Multipart) -> Result<Json<SniffResponse>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    if form.image_data.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "image_data is required",
        ));
    }

    Ok(Json(SniffResponse {
        mime_type: mime::resolve_mime_type(None, &form.image_data),
    }))
}

/// Start the upload API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

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
    use crate::config::PublishConfig;
    use axum::body::Body;
    use axum::http::Request;
    use photo_pipeline::{IngestRequest, InMemoryBroker};
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "photo-boundary";
    const TOPIC: &str = "photo.ingest.requests";

    fn router(broker: &InMemoryBroker) -> Router {
        let producer = IngressProducer::new(Arc::new(broker.clone()), TOPIC)
            .with_publish_policy(PublishConfig::with_budget(Duration::from_millis(200)));
        create_router(
            AppState {
                producer: Arc::new(producer),
            },
            &ApiConfig::default(),
        )
    }

    fn multipart_body(nickname: Option<&str>, file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(nickname) = nickname {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"nickname\"\r\n\r\n{nickname}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((content_type, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image_data\"; filename=\"upload\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(path: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_is_accepted() {
        let broker = InMemoryBroker::new();
        let body = multipart_body(Some("alice"), Some(("image/png", b"\x89PNG\r\n\x1a\nrest")));

        let response = router(&broker)
            .oneshot(upload("/api/v1/images", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = json_body(response).await;
        assert_eq!(json["status"], "accepted");

        let published = broker.published(TOPIC);
        assert_eq!(published.len(), 1);
        let request = IngestRequest::decode(&published[0].payload).unwrap();
        assert_eq!(request.request_id.to_string(), json["request_id"]);
        assert_eq!(request.mime_type, "image/png");
    }

    #[tokio::test]
    async fn test_missing_nickname_is_bad_request() {
        let broker = InMemoryBroker::new();
        let body = multipart_body(None, Some(("image/png", b"data")));

        let response = router(&broker)
            .oneshot(upload("/api/v1/images", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "validation_error");
        assert!(broker.published(TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_broker_down_is_service_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let body = multipart_body(Some("alice"), Some(("image/png", b"data")));

        let response = router(&broker)
            .oneshot(upload("/api/v1/images", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upload_over_message_limit_is_payload_too_large() {
        let broker = InMemoryBroker::new().with_max_message_bytes(2048);
        let body = multipart_body(Some("alice"), Some(("image/png", &[0u8; 4096])));

        let response = router(&broker)
            .oneshot(upload("/api/v1/images", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["code"], "payload_too_large");
        assert!(broker.published(TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_sniff_ignores_declared_type() {
        let broker = InMemoryBroker::new();
        let body = multipart_body(None, Some(("text/plain", b"\xFF\xD8\xFF\xE0jfif")));

        let response = router(&broker)
            .oneshot(upload("/api/v1/sniff-mime", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["mime_type"], "image/jpeg");
    }
}
