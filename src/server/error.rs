//! Structured JSON error responses.

use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::backend::{BackendError, BackendKind};
use crate::orchestrator::ProcessError;

/// Body of every non-success response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

/// An error returned from a handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                code,
                request_id: None,
                backend: None,
                gpu_mode: None,
                fallback_from: None,
                fallback_reason: None,
                stdout_tail: None,
                stderr_tail: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.body.request_id = Some(request_id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ErrorBody {
        &self.body
    }

    /// Unhandled fault, surfaced with the panic message when there is one.
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic".to_string()
        };
        Self::internal(format!("Unhandled error: {}", detail))
    }

    /// Map a failed request onto a status code and diagnostic body.
    pub fn from_process(err: &ProcessError) -> Self {
        match err {
            ProcessError::MissingImage => Self::bad_request(err.to_string()),
            ProcessError::Staging(_) | ProcessError::Artifact(_) => Self::internal(err.to_string()),
            ProcessError::Automation {
                source,
                render_mode,
                fallback_reason,
            } => {
                let (status, code) = match source {
                    BackendError::TimedOut { .. } => {
                        (StatusCode::GATEWAY_TIMEOUT, "AUTOMATION_TIMEOUT")
                    }
                    BackendError::ArtifactMissing { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "ARTIFACT_MISSING")
                    }
                    BackendError::Launch { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "AUTOMATION_UNAVAILABLE")
                    }
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "AUTOMATION_FAILED"),
                };

                let mut api = Self::new(status, code, source.to_string());
                api.body.backend = Some(BackendKind::Automation.as_str());
                api.body.gpu_mode = Some(render_mode.is_gpu());
                if let Some(reason) = fallback_reason {
                    api.body.fallback_from = Some(BackendKind::Accelerated.as_str());
                    api.body.fallback_reason = Some(reason.clone());
                }
                if let Some(diagnostics) = source.diagnostics() {
                    api.body.stdout_tail = Some(diagnostics.stdout_tail.clone());
                    api.body.stderr_tail = Some(diagnostics.stderr_tail.clone());
                }
                api
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
