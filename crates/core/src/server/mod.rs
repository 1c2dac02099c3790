use std::path::Path as StdPath;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};

mod assets;

use crate::batch::ConversionPipeline;
use crate::bundle::{content_disposition, ConversionPayload, ZIP_CONTENT_TYPE};
use crate::config::{AppConfig, LimitsConfig};
use crate::environment::EnvironmentReport;
use crate::error::PipelineError;
use crate::job::{JobOutcome, JobRegistry, JobResponse};
use crate::upload::{check_size, display_name, UploadedFile, DOCX_CONTENT_TYPE, UPLOAD_FIELD};

pub const CONVERTED_COUNT_HEADER: &str = "x-converted-count";
pub const FAILED_COUNT_HEADER: &str = "x-failed-count";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    pipeline: ConversionPipeline,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// `shutdown` is handed to every converter process; cancelling it kills
    /// in-flight children.
    pub fn new(config: AppConfig, shutdown: CancellationToken) -> Self {
        let pipeline = ConversionPipeline::new(&config, JobRegistry::new(), shutdown);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                pipeline,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &ConversionPipeline {
        &self.inner.pipeline
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let static_dir = state.config().paths.static_dir.clone();
    app_router_with_static(state, static_dir.as_deref())
}

pub fn app_router_with_static(state: AppState, static_dir: Option<&StdPath>) -> Router {
    let body_limit = state.config().limits.request_body_limit();
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/environment", get(environment))
        .route("/api/jobs", get(list_jobs))
        .route(
            "/api/convert",
            post(convert).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match static_dir {
        Some(dir) => {
            let index = dir.join("index.html");
            api.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        None => api.fallback(assets::embedded_client),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    started_at: DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        started_at: state.inner.started_at,
    })
}

async fn environment(State(state): State<AppState>) -> Result<Json<EnvironmentReport>, AppError> {
    let report = state.pipeline().check_environment().await.map_err(|err| {
        warn!(error = %err, "Environment check failed");
        AppError::from(err)
    })?;
    Ok(Json(report))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobResponse>> {
    Json(state.pipeline().registry().snapshot())
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn convert(State(state): State<AppState>, multipart: Multipart) -> Result<Response, AppError> {
    let outcome = async {
        let files = read_uploads(multipart, state.pipeline().limits()).await?;
        info!(
            files = files.len(),
            names = ?files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Conversion request received"
        );
        state.pipeline().process(files).await
    }
    .await;

    match outcome {
        Ok(payload) => Ok(payload_response(payload)),
        Err(err) => {
            match &err {
                PipelineError::ServerFault(_) => error!(error = %err, "Conversion request failed"),
                other => warn!(kind = other.kind(), error = %err, "Conversion request rejected"),
            }
            Err(err.into())
        }
    }
}

/// Collects every `pdf` part, enforcing the per-file size cap while the
/// part streams in. Parts with neither a filename nor a body are what a
/// browser sends for an empty file input and are skipped.
async fn read_uploads(
    mut multipart: Multipart,
    limits: &LimitsConfig,
) -> Result<Vec<UploadedFile>, PipelineError> {
    let mut files = Vec::new();

    let rejected = |err: MultipartError| multipart_error(err, limits);
    while let Some(mut field) = multipart.next_field().await.map_err(rejected)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let raw_name = field.file_name().unwrap_or_default().to_string();
        let name = display_name(&raw_name);

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(rejected)? {
            check_size(&name, (bytes.len() + chunk.len()) as u64, limits)?;
            bytes.extend_from_slice(&chunk);
        }

        if raw_name.is_empty() && bytes.is_empty() {
            continue;
        }
        if limits.max_files > 0 && files.len() >= limits.max_files {
            return Err(PipelineError::TooManyFiles {
                count: files.len() + 1,
                max: limits.max_files,
            });
        }
        files.push(UploadedFile::new(&raw_name, bytes));
    }

    Ok(files)
}

/// The body limit surfaces as a multipart error; report it as a size error.
fn multipart_error(err: MultipartError, limits: &LimitsConfig) -> PipelineError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return PipelineError::FileTooLarge {
            file: "request".to_string(),
            limit_mb: limits.max_file_bytes / (1024 * 1024),
        };
    }
    PipelineError::MalformedUpload(err.body_text())
}

fn payload_response(payload: ConversionPayload) -> Response {
    match payload {
        ConversionPayload::Document { file_name, bytes } => (
            [
                (header::CONTENT_TYPE, DOCX_CONTENT_TYPE.to_string()),
                (header::CONTENT_DISPOSITION, content_disposition(&file_name)),
            ],
            bytes,
        )
            .into_response(),
        ConversionPayload::Archive {
            file_name,
            bytes,
            converted,
            failed,
        } => (
            [
                (header::CONTENT_TYPE, ZIP_CONTENT_TYPE.to_string()),
                (header::CONTENT_DISPOSITION, content_disposition(&file_name)),
                (
                    header::HeaderName::from_static(CONVERTED_COUNT_HEADER),
                    converted.to_string(),
                ),
                (
                    header::HeaderName::from_static(FAILED_COUNT_HEADER),
                    failed.to_string(),
                ),
                (
                    header::ACCESS_CONTROL_EXPOSE_HEADERS,
                    format!("{CONVERTED_COUNT_HEADER}, {FAILED_COUNT_HEADER}, content-disposition"),
                ),
            ],
            bytes,
        )
            .into_response(),
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    files: Vec<JobOutcome>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    Unavailable(String),
    Internal(String),
    BatchFailed {
        message: String,
        files: Vec<JobOutcome>,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, files) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, Vec::new()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, Vec::new()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, Vec::new()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, Vec::new()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, Vec::new()),
            AppError::BatchFailed { message, files } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, files)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            files,
        });
        (status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::NoFileProvided
            | PipelineError::TooManyFiles { .. }
            | PipelineError::InvalidPdf { .. }
            | PipelineError::MalformedUpload(_) => AppError::BadRequest(message),
            PipelineError::FileTooLarge { .. } => AppError::PayloadTooLarge(message),
            PipelineError::EnvironmentUnavailable { .. } => AppError::Unavailable(message),
            PipelineError::BatchFailed { outcomes } => AppError::BatchFailed {
                message,
                files: outcomes,
            },
            PipelineError::ConversionProcessFailed { .. }
            | PipelineError::OutputNotFound { .. }
            | PipelineError::ServerFault(_) => AppError::Internal(message),
        }
    }
}
