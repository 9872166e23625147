use std::{path::Path, sync::Arc};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::{error::ServiceError, extractor::VideoInfo, service::DownloadService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DownloadService>,
}

#[derive(Debug, Deserialize)]
struct InfoForm {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadForm {
    url: String,
    format: String,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    #[serde(flatten)]
    info: VideoInfo,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    message: String,
    download_url: String,
    cached: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    fn with_code(status: StatusCode, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let message = error.to_string();
        match error {
            ServiceError::InvalidFormat(_) => {
                Self::with_code(StatusCode::BAD_REQUEST, message, "INVALID_FORMAT")
            }
            ServiceError::InvalidUrl => {
                Self::with_code(StatusCode::BAD_REQUEST, message, "INVALID_URL")
            }
            ServiceError::InvalidQuality(_) => {
                Self::with_code(StatusCode::BAD_REQUEST, message, "INVALID_QUALITY")
            }
            ServiceError::ProbeFailed(_) => {
                Self::with_code(StatusCode::BAD_REQUEST, message, "PROBE_FAILED")
            }
            ServiceError::DownloadFailed(_) => {
                Self::with_code(StatusCode::BAD_REQUEST, message, "DOWNLOAD_FAILED")
            }
            ServiceError::FileNotFound => {
                Self::with_code(StatusCode::NOT_FOUND, message, "FILE_NOT_FOUND")
            }
            ServiceError::Internal(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/info", post(fetch_info))
        .route("/download", post(start_download))
        .route("/file/{download_id}/{file_name}", get(fetch_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn fetch_info(
    State(state): State<AppState>,
    Form(payload): Form<InfoForm>,
) -> Result<Json<InfoResponse>, ApiError> {
    let info = state.service.info(&payload.url).await?;
    Ok(Json(InfoResponse {
        success: true,
        info,
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Form(payload): Form<DownloadForm>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let outcome = state
        .service
        .download(&payload.url, &payload.format, payload.quality.as_deref())
        .await?;

    let message = if outcome.cached {
        "Sirviendo archivo en cache".to_string()
    } else {
        format!(
            "Descargado: {}",
            outcome.title.as_deref().unwrap_or(&outcome.file_name)
        )
    };

    Ok(Json(DownloadResponse {
        success: true,
        message,
        download_url: outcome.download_url,
        cached: outcome.cached,
    }))
}

async fn fetch_file(
    State(state): State<AppState>,
    UrlPath((download_id, file_name)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state.service.resolve_file(&download_id, &file_name).await?;

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            ApiError::from(ServiceError::FileNotFound)
        } else {
            ApiError::internal(format!("No se pudo leer el archivo: {error}"))
        }
    })?;
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("No se pudo leer metadata del archivo: {error}"))
    })?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for_filename(&file_name)));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("No se pudo crear el tamano de descarga."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&file_name))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );

    Ok((headers, body).into_response())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
