//! HTTP request handlers.

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use super::error::ApiError;
use super::AppState;
use crate::orchestrator::{ImageUpload, Submission};

pub const BACKEND_HEADER: &str = "x-fir-backend";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Accept an image upload and return the TSV report.
pub async fn process_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut submission = Submission::new(None);
    let request_id = submission.request_id.clone();

    let mut multipart = multipart.map_err(|rej| {
        ApiError::new(rej.status(), "INVALID_UPLOAD", rej.body_text())
            .with_request_id(request_id.clone())
    })?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_upload(e, &request_id))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                // Only file parts count as the upload.
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| invalid_upload(e, &request_id))?;
                submission.image = Some(ImageUpload {
                    file_name: Some(file_name),
                    data: data.to_vec(),
                });
            }
            "label" => {
                if let Some(value) = text_value(field, &request_id).await? {
                    submission.label = value;
                }
            }
            "stockpile" => {
                if let Some(value) = text_value(field, &request_id).await? {
                    submission.stockpile = value;
                }
            }
            "version" => {
                if let Some(value) = text_value(field, &request_id).await? {
                    submission.version = value;
                }
            }
            _ => {}
        }
    }

    // Detached so a dropped client connection does not abort a running pipeline.
    let orchestrator = state.orchestrator.clone();
    let joined = tokio::spawn(async move { orchestrator.process(submission).await }).await;

    let completed = match joined {
        Ok(Ok(completed)) => completed,
        Ok(Err(e)) => return Err(ApiError::from_process(&e).with_request_id(request_id)),
        Err(e) => {
            error!("[{}] Request task failed: {}", request_id, e);
            let api = match e.try_into_panic() {
                Ok(payload) => ApiError::from_panic(payload),
                Err(_) => ApiError::internal("Request was cancelled"),
            };
            return Err(api.with_request_id(request_id));
        }
    };

    let content = tokio::fs::read(&completed.artifact).await.map_err(|e| {
        error!(
            "[{}] Failed to read report {}: {}",
            request_id,
            completed.artifact.display(),
            e
        );
        ApiError::internal("Failed to read report").with_request_id(request_id.clone())
    })?;

    let file_name = completed
        .artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&completed.artifact)
        .first_or_octet_stream()
        .to_string();

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
            (
                HeaderName::from_static(BACKEND_HEADER),
                completed.backend.as_str().to_string(),
            ),
            (HeaderName::from_static(REQUEST_ID_HEADER), request_id),
        ],
        content,
    )
        .into_response())
}

/// Liveness and configured backend.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "backend": state.orchestrator.preferred().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Read a text field; blank values count as absent so defaults apply.
async fn text_value(field: Field<'_>, request_id: &str) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|e| invalid_upload(e, request_id))?;
    let trimmed = value.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

fn invalid_upload(err: MultipartError, request_id: &str) -> ApiError {
    ApiError::new(err.status(), "INVALID_UPLOAD", err.body_text()).with_request_id(request_id)
}
