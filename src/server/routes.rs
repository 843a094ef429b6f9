//! Router configuration for the OCR service.

use std::any::Any;

use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::handlers;
use super::AppState;

/// Create the service router.
pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/process", post(handlers::process_image))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let api = ApiError::from_panic(err);
    tracing::error!("Request handler panicked: {}", api.body().error);
    api.into_response()
}
