//! HTTP front end for the OCR service.
//!
//! Exposes:
//! - `POST /process`: multipart upload (`image`, optional `label`, `stockpile`,
//!   `version`) answered with the TSV report as an attachment
//! - `GET /health`: liveness and configured backend
//!
//! Optionally serves a static site directory on a second listener.

mod error;
mod handlers;
mod routes;

pub use error::{ApiError, ErrorBody};
pub use handlers::{BACKEND_HEADER, REQUEST_ID_HEADER};
pub use routes::create_router;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Settings;
use crate::orchestrator::Orchestrator;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Listener configuration for [`serve`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: SocketAddr,
    pub max_upload_bytes: usize,
    /// Static site to serve alongside the API, if any.
    pub site_dir: Option<PathBuf>,
    pub site_addr: SocketAddr,
}

/// Start the web server.
pub async fn serve(settings: &Settings, options: &ServerOptions) -> anyhow::Result<()> {
    let orchestrator = settings.build_orchestrator()?;
    orchestrator
        .scratch()
        .ensure_dir()
        .await
        .with_context(|| format!("creating {}", orchestrator.scratch().path().display()))?;
    orchestrator
        .artifacts()
        .ensure_dir()
        .await
        .with_context(|| format!("creating {}", orchestrator.artifacts().dir().display()))?;

    let automation = settings.automation_backend();
    if automation.is_available() {
        info!("{}", automation.availability_hint());
    } else {
        warn!("{}", automation.availability_hint());
    }
    info!(
        "Preferred backend: {} (accelerated service at {}, min free {} MiB)",
        settings.backend, settings.gpu_url, settings.min_free_mb
    );

    if let Some(ref dir) = options.site_dir {
        let listener = tokio::net::TcpListener::bind(options.site_addr)
            .await
            .with_context(|| format!("binding site listener {}", options.site_addr))?;
        info!("Serving {} at http://{}", dir.display(), options.site_addr);
        let site = site_router(dir.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, site).await {
                warn!("Static site server stopped: {}", e);
            }
        });
    }

    let app = create_router(AppState::new(orchestrator), options.max_upload_bytes);

    tracing::info!("Starting server at http://{}", options.addr);
    let listener = tokio::net::TcpListener::bind(options.addr)
        .await
        .with_context(|| format!("binding {}", options.addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Static file router for the site directory.
pub fn site_router(dir: PathBuf) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
