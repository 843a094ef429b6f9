//! Text-extraction backends.
//!
//! Two interchangeable execution paths produce the stockpile table:
//! - **Automation** (`browser`): a local rendering pipeline run as a bounded
//!   subprocess that writes the TSV report into the shared output directory.
//! - **Accelerated** (`gpu`): a remote OCR service that returns recognized text
//!   lines over HTTP.
//!
//! Both are reached through traits so the orchestrator can hold them as
//! trait objects and tests can substitute fakes.

mod accelerated;
mod automation;

pub use accelerated::{HttpAcceleratedBackend, RetryPolicy};
pub use automation::{ProcessAutomationBackend, DIAGNOSTIC_TAIL_BYTES};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Available backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum BackendKind {
    /// Headless rendering pipeline driven as a subprocess.
    #[value(name = "browser")]
    Automation,
    /// Remote accelerator-backed OCR service.
    #[value(name = "gpu")]
    Accelerated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Automation => "browser",
            BackendKind::Accelerated => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse rendering mode advertised to the automation pipeline.
///
/// Advisory only: the pipeline is told whether accelerator headroom exists,
/// nothing verifies that it honored the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Cpu,
    Gpu,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Cpu => "cpu",
            RenderMode::Gpu => "gpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, RenderMode::Gpu)
    }
}

/// Size-bounded tails of a process's captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Errors from backend adapters.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("accelerated backend not ready after {attempts} health checks: {last_error}")]
    NotReady { attempts: u32, last_error: String },

    #[error("accelerated OCR failed after {attempts} attempts: {last_error}")]
    OcrFailed { attempts: u32, last_error: String },

    #[error("automation process exited with {}", describe_exit(.code))]
    ProcessFailed {
        code: Option<i32>,
        diagnostics: Diagnostics,
    },

    #[error("automation process timed out after {}s", .timeout.as_secs())]
    TimedOut {
        timeout: Duration,
        diagnostics: Diagnostics,
    },

    #[error("TSV not found after processing")]
    ArtifactMissing {
        expected: PathBuf,
        diagnostics: Diagnostics,
    },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Captured process output, for failures that have any.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            BackendError::ProcessFailed { diagnostics, .. }
            | BackendError::TimedOut { diagnostics, .. }
            | BackendError::ArtifactMissing { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::TimedOut { .. })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Fields the automation pipeline receives for one request.
#[derive(Debug, Clone)]
pub struct AutomationJob<'a> {
    pub image: &'a Path,
    pub label: &'a str,
    pub stockpile: &'a str,
    pub version: &'a str,
    pub render_mode: RenderMode,
}

/// Local automation pipeline that writes the canonical artifact as a side effect.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Run the pipeline to completion and return the path of the artifact it produced.
    async fn run(&self, job: &AutomationJob<'_>) -> Result<PathBuf, BackendError>;
}

/// Remote OCR service returning recognized lines directly.
#[async_trait]
pub trait AcceleratedBackend: Send + Sync {
    /// Recognize text in an image, returning lines in reading order.
    async fn recognize(&self, image: &Path) -> Result<Vec<String>, BackendError>;
}
