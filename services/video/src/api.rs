use crate::config::ApiConfig;
use crate::identity::{bearer_token, AuthError, IdentityVerifier};
use crate::object_store::ObjectStore;
use crate::pipeline::{load_owned_video, ErrorKind, PipelineError, UploadPipeline, UploadStage};
use crate::resolver::ReferenceResolver;
use crate::thumbnails::{ThumbnailService, ASSETS_ROUTE};
use crate::video_store::{VideoRecord, VideoRepository};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Multipart field carrying the video file
pub const VIDEO_FIELD: &str = "video";
/// Multipart field carrying the thumbnail image
pub const THUMBNAIL_FIELD: &str = "thumbnail";

/// `Warning` header value sent when a written record could not be resolved
pub const UNRESOLVED_WARNING: &str = "199 tubely-video \"record updated; video_url could not be resolved\"";

/// Room for multipart framing on top of the file size limit
const MULTIPART_OVERHEAD_BYTES: u64 = 1 << 20;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub thumbnails: Arc<ThumbnailService>,
    pub resolver: Arc<ReferenceResolver<dyn ObjectStore>>,
    pub videos: Arc<dyn VideoRepository>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub max_upload_bytes: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub stage: Option<UploadStage>,
    pub retryable: bool,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Unable to parse multipart form: {0}")]
    Form(String),

    #[error("Multipart form has no {0:?} field")]
    MissingField(&'static str),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Form(_) | ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(e) => match e.kind() {
                ErrorKind::InputRejected | ErrorKind::InvalidReference => StatusCode::BAD_REQUEST,
                ErrorKind::AuthorizationFailed => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InspectionFailed | ErrorKind::ProcessingFailed => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ErrorKind::StorageFailed => StatusCode::BAD_GATEWAY,
                ErrorKind::MetadataFailed => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Auth(AuthError::InvalidCredentials) => "INVALID_CREDENTIALS",
            ApiError::Auth(_) => "MISSING_CREDENTIALS",
            ApiError::Form(_) | ApiError::MissingField(_) => "INVALID_FORM",
            ApiError::Pipeline(e) => match e.kind() {
                ErrorKind::InputRejected => "INPUT_REJECTED",
                ErrorKind::NotFound => "NOT_FOUND",
                ErrorKind::AuthorizationFailed => "NOT_OWNER",
                ErrorKind::InspectionFailed => "INSPECTION_FAILED",
                ErrorKind::ProcessingFailed => "PROCESSING_FAILED",
                ErrorKind::StorageFailed => "STORAGE_ERROR",
                ErrorKind::MetadataFailed => "METADATA_ERROR",
                ErrorKind::InvalidReference => "INVALID_REFERENCE",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let (stage, retryable) = match &self {
            ApiError::Pipeline(e) => (Some(e.stage()), e.is_retryable()),
            _ => (None, false),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            stage,
            retryable,
        };

        (status, Json(body)).into_response()
    }
}

/// Create the API router
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

    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let assets = ServeDir::new(state.thumbnails.assets_root());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/videos/:video_id", get(get_video))
        .route("/api/videos/:video_id/upload", post(upload_video))
        .route("/api/thumbnail_upload/:video_id", post(upload_thumbnail))
        .nest_service(ASSETS_ROUTE, assets)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "video-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.videos.ping().await {
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

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = bearer_token(headers)?;
    let principal = state.verifier.verify(token).await.map_err(|e| {
        warn!(error = %e, "Rejected credentials");
        e
    })?;
    Ok(principal)
}

fn form_error(e: MultipartError) -> ApiError {
    ApiError::Form(e.body_text())
}

fn field_content_type(field: &Field<'_>) -> String {
    field.content_type().unwrap_or_default().to_string()
}

/// Get a video with its reference resolved to a usable URL
#[instrument(skip(state, headers))]
async fn get_video(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<VideoRecord>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let record = load_owned_video(state.videos.as_ref(), principal, video_id).await?;
    let resolved = state
        .resolver
        .resolve_record(&record)
        .await
        .map_err(PipelineError::from)?;

    Ok(Json(resolved))
}

/// Respond with a record the request has already written. A resolution
/// failure no longer fails the request: the stored reference is returned
/// unresolved with a `Warning` header and a later GET can retry.
async fn written_record_response(state: &AppState, record: VideoRecord) -> Response {
    match state.resolver.resolve_record(&record).await {
        Ok(resolved) => Json(resolved).into_response(),
        Err(e) => {
            warn!(video_id = %record.id, error = %e, "Record updated but its video reference could not be resolved");
            let mut response = Json(record).into_response();
            response.headers_mut().insert(
                header::WARNING,
                HeaderValue::from_static(UNRESOLVED_WARNING),
            );
            response
        }
    }
}

/// Upload a video file for an existing record
#[instrument(skip(state, headers, multipart))]
async fn upload_video(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    info!(%principal, "Uploading video");

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }
        let content_type = field_content_type(&field);
        let outcome = state
            .pipeline
            .upload_video(principal, video_id, &content_type, field)
            .await?;

        return Ok(written_record_response(&state, outcome.record).await);
    }

    Err(ApiError::MissingField(VIDEO_FIELD))
}

/// Upload a thumbnail image for an existing record
#[instrument(skip(state, headers, multipart))]
async fn upload_thumbnail(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    info!(%principal, "Uploading thumbnail");

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        if field.name() != Some(THUMBNAIL_FIELD) {
            continue;
        }
        let content_type = field_content_type(&field);
        let record = state
            .thumbnails
            .upload_thumbnail(principal, video_id, &content_type, field)
            .await?;

        return Ok(written_record_response(&state, record).await);
    }

    Err(ApiError::MissingField(THUMBNAIL_FIELD))
}

/// Start the API server, returning once `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting video API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
