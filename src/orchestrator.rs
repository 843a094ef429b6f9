//! End-to-end request handling.
//!
//! A request moves through: received → staged → routed → backend invoked →
//! (fallback) → cleaned. Accelerated failures are recovered by one re-route
//! to the automation backend; automation failures are terminal. The staged
//! upload is removed when its guard drops at the end of [`Orchestrator::process`],
//! whichever branch returned (or unwound).

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::backend::{
    AcceleratedBackend, AutomationBackend, AutomationJob, BackendError, BackendKind, RenderMode,
};
use crate::config::DEFAULT_MIN_FREE_MIB;
use crate::probe::ResourceProbe;
use crate::routing::{self, RouteReason};
use crate::staging::ScratchDir;

pub const DEFAULT_LABEL: &str = "Default_Label";
pub const DEFAULT_STOCKPILE: &str = "Public";
pub const DEFAULT_VERSION: &str = "airborne-63";

/// Uploaded image bytes.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// Client-supplied file name, if any.
    pub file_name: Option<String>,
    pub data: Vec<u8>,
}

/// One inbound extraction request.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Correlation id for logs and error bodies.
    pub request_id: String,
    pub image: Option<ImageUpload>,
    pub label: String,
    pub stockpile: String,
    pub version: String,
}

impl Submission {
    /// A submission with default labelling fields and a fresh request id.
    pub fn new(image: Option<ImageUpload>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            image,
            label: DEFAULT_LABEL.to_string(),
            stockpile: DEFAULT_STOCKPILE.to_string(),
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

/// A request that produced its report.
#[derive(Debug, Clone)]
pub struct Completed {
    pub request_id: String,
    /// Location of the canonical TSV report.
    pub artifact: PathBuf,
    /// Backend that produced the report.
    pub backend: BackendKind,
    /// Why the accelerated backend was abandoned, when a fallback happened.
    pub fallback_reason: Option<String>,
}

/// Terminal request failures.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("No image file provided")]
    MissingImage,

    #[error("Failed to stage upload: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Failed to write report: {0}")]
    Artifact(#[source] std::io::Error),

    #[error("{source}")]
    Automation {
        source: BackendError,
        render_mode: RenderMode,
        fallback_reason: Option<String>,
    },
}

/// Routes requests between the backends and owns their staged files.
pub struct Orchestrator {
    probe: Arc<dyn ResourceProbe>,
    automation: Arc<dyn AutomationBackend>,
    accelerated: Arc<dyn AcceleratedBackend>,
    scratch: ScratchDir,
    artifacts: ArtifactStore,
    preferred: BackendKind,
    threshold_mib: u64,
}

impl Orchestrator {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        automation: Arc<dyn AutomationBackend>,
        accelerated: Arc<dyn AcceleratedBackend>,
        scratch: ScratchDir,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            probe,
            automation,
            accelerated,
            scratch,
            artifacts,
            preferred: BackendKind::Automation,
            threshold_mib: DEFAULT_MIN_FREE_MIB,
        }
    }

    /// Set the preferred backend.
    pub fn with_preferred(mut self, preferred: BackendKind) -> Self {
        self.preferred = preferred;
        self
    }

    /// Set the free-memory threshold for the accelerated backend.
    pub fn with_threshold_mib(mut self, threshold_mib: u64) -> Self {
        self.threshold_mib = threshold_mib;
        self
    }

    pub fn preferred(&self) -> BackendKind {
        self.preferred
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run a submission to completion.
    pub async fn process(&self, submission: Submission) -> Result<Completed, ProcessError> {
        let Submission {
            request_id,
            image,
            label,
            stockpile,
            version,
        } = submission;

        let image = image.ok_or(ProcessError::MissingImage)?;
        info!(
            "[{}] Received {} byte upload (label '{}', stockpile '{}', version '{}')",
            request_id,
            image.data.len(),
            label,
            stockpile,
            version
        );

        let staged = self
            .scratch
            .stage(image.file_name.as_deref(), &image.data)
            .await
            .map_err(ProcessError::Staging)?;
        drop(image);

        let reading = self.probe.read().await;
        let route = routing::route(self.preferred, reading, self.threshold_mib);
        let render_mode = routing::render_mode(reading, self.threshold_mib);
        match route.reason {
            RouteReason::Preferred => info!(
                "[{}] Routing to {} backend (headroom: {})",
                request_id, route.backend, reading
            ),
            RouteReason::InsufficientHeadroom => warn!(
                "[{}] Headroom {} below {} MiB, routing to {} backend",
                request_id, reading, self.threshold_mib, route.backend
            ),
        }

        let mut fallback_reason = None;
        if route.backend == BackendKind::Accelerated {
            match self.accelerated.recognize(staged.path()).await {
                Ok(lines) => {
                    let artifact = self
                        .artifacts
                        .write_lines(&label, &lines)
                        .await
                        .map_err(ProcessError::Artifact)?;
                    info!(
                        "[{}] Accelerated backend produced {} rows: {}",
                        request_id,
                        lines.len(),
                        artifact.display()
                    );
                    return Ok(Completed {
                        request_id,
                        artifact,
                        backend: BackendKind::Accelerated,
                        fallback_reason: None,
                    });
                }
                Err(e) => {
                    warn!(
                        "[{}] Accelerated backend failed, falling back to automation: {}",
                        request_id, e
                    );
                    fallback_reason = Some(e.to_string());
                }
            }
        }

        let job = AutomationJob {
            image: staged.path(),
            label: &label,
            stockpile: &stockpile,
            version: &version,
            render_mode,
        };

        match self.automation.run(&job).await {
            Ok(artifact) => {
                info!("[{}] Report ready: {}", request_id, artifact.display());
                Ok(Completed {
                    request_id,
                    artifact,
                    backend: BackendKind::Automation,
                    fallback_reason,
                })
            }
            Err(source) => {
                warn!("[{}] Automation backend failed: {}", request_id, source);
                Err(ProcessError::Automation {
                    source,
                    render_mode,
                    fallback_reason,
                })
            }
        }
    }
}
