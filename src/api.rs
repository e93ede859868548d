//! HTTP shim over [`ConversionService`].

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::service::{ConversionService, RetrieveError, SubmitError};

/// Multipart framing and the form fields on top of the file itself.
const BODY_LIMIT_SLACK: u64 = 1024 * 1024;

pub type AppState = Arc<ConversionService>;

pub fn router(service: AppState) -> Router {
    let body_limit = service.max_upload_bytes().saturating_add(BODY_LIMIT_SLACK);
    Router::new()
        .route("/health", get(health))
        .route("/api/convert", post(convert))
        .route("/api/status/:id", get(status))
        .route("/api/download/:id", get(download))
        .route("/api/formats", get(formats))
        .layer(DefaultBodyLimit::max(usize::try_from(body_limit).unwrap_or(usize::MAX)))
        .with_state(service)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            error,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "Server error in API handler");
        }
        let body = json!({
            "error": self.error,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::TooLarge { .. } => {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", err.to_string())
            }
            SubmitError::NotSupported(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "unsupported_conversion", err.to_string())
            }
            err if err.is_validation() => ApiError::bad_request(err.to_string()),
            err => ApiError::internal(err.to_string()),
        }
    }
}

impl From<RetrieveError> for ApiError {
    fn from(err: RetrieveError) -> Self {
        match err {
            RetrieveError::NotFound(detail) => ApiError::new(StatusCode::NOT_FOUND, "not_found", detail),
            RetrieveError::NotReady(_) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "not_ready",
                format!("Conversion not yet completed: {err}"),
            ),
            RetrieveError::Internal(detail) => ApiError::internal(detail),
        }
    }
}

async fn health(State(service): State<AppState>) -> impl IntoResponse {
    let health = service.health().await;
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": health.status,
            "version": env!("CARGO_PKG_VERSION"),
            "storage_backend": health.storage_backend,
            "checks": { "storage": health.storage, "broker": health.broker },
        })),
    )
}

#[derive(Default)]
struct ConvertForm {
    filename: Option<String>,
    data: Option<bytes::Bytes>,
    from_format: Option<String>,
    to_format: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<ConvertForm, ApiError> {
    let mut form = ConvertForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(multipart_error(err)),
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                form.filename = field.file_name().map(str::to_string);
                form.data = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "from_format" => form.from_format = Some(field.text().await.map_err(multipart_error)?),
            "to_format" => form.to_format = Some(field.text().await.map_err(multipart_error)?),
            _ => {}
        }
    }
    Ok(form)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(status, "file_too_large", err.body_text())
    } else {
        ApiError::bad_request(err.body_text())
    }
}

async fn convert(State(service): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;

    let data = form.data.ok_or_else(|| ApiError::bad_request("missing 'file' field"))?;
    let filename = form
        .filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("uploaded file has no filename"))?;
    let from = form
        .from_format
        .ok_or_else(|| ApiError::bad_request("missing 'from_format' field"))?;
    let to = form
        .to_format
        .ok_or_else(|| ApiError::bad_request("missing 'to_format' field"))?;

    let submitted = service.submit(&filename, &from, &to, &data).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)).into_response())
}

async fn status(State(service): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let report = service
        .status(&id)
        .await
        .map_err(|err| ApiError::internal(format!("Error checking task status: {err:#}")))?;
    Ok(Json(report).into_response())
}

async fn download(State(service): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let artifact = service.retrieve(&id).await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    Ok((
        [
            (header::CONTENT_TYPE, artifact.media_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.data,
    )
        .into_response())
}

async fn formats(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.formats())
}
