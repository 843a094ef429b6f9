//! In-process fakes for the probe and both backends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::artifact::ArtifactStore;
use crate::backend::{
    AcceleratedBackend, AutomationBackend, AutomationJob, BackendError, BackendKind, Diagnostics,
    RenderMode,
};
use crate::orchestrator::Orchestrator;
use crate::probe::{ResourceProbe, ResourceReading};
use crate::staging::ScratchDir;

/// Report body the fake automation pipeline writes.
pub const PIPELINE_REPORT: &str = "Item\tCrated\nBasic Materials\t12\n";

pub struct FixedProbe(pub ResourceReading);

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn read(&self) -> ResourceReading {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AutomationBehavior {
    WriteReport,
    Fail,
    TimeOut,
    NoArtifact,
    Panic,
}

pub struct FakeAutomation {
    behavior: AutomationBehavior,
    artifacts: ArtifactStore,
    pub calls: AtomicUsize,
    pub saw_staged_file: AtomicBool,
    pub last_render_mode: Mutex<Option<RenderMode>>,
}

impl FakeAutomation {
    pub fn new(behavior: AutomationBehavior, artifacts: ArtifactStore) -> Self {
        Self {
            behavior,
            artifacts,
            calls: AtomicUsize::new(0),
            saw_staged_file: AtomicBool::new(false),
            last_render_mode: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AutomationBackend for FakeAutomation {
    async fn run(&self, job: &AutomationJob<'_>) -> Result<PathBuf, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.saw_staged_file
            .store(job.image.exists(), Ordering::SeqCst);
        *self.last_render_mode.lock().unwrap() = Some(job.render_mode);

        match self.behavior {
            AutomationBehavior::WriteReport => {
                self.artifacts.ensure_dir().await?;
                let path = self.artifacts.path_for(job.label);
                tokio::fs::write(&path, PIPELINE_REPORT).await?;
                Ok(path)
            }
            AutomationBehavior::Fail => Err(BackendError::ProcessFailed {
                code: Some(1),
                diagnostics: Diagnostics {
                    stdout_tail: "rendering page 1\n".to_string(),
                    stderr_tail: "Error: canvas crashed\n".to_string(),
                },
            }),
            AutomationBehavior::TimeOut => Err(BackendError::TimedOut {
                timeout: Duration::from_secs(180),
                diagnostics: Diagnostics::default(),
            }),
            AutomationBehavior::NoArtifact => Err(BackendError::ArtifactMissing {
                expected: self.artifacts.path_for(job.label),
                diagnostics: Diagnostics::default(),
            }),
            AutomationBehavior::Panic => panic!("automation pipeline crashed"),
        }
    }
}

pub struct FakeAccelerated {
    lines: Option<Vec<String>>,
    pub calls: AtomicUsize,
}

impl FakeAccelerated {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            lines: Some(lines.iter().map(|l| l.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            lines: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AcceleratedBackend for FakeAccelerated {
    async fn recognize(&self, _image: &Path) -> Result<Vec<String>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.lines {
            Some(lines) => Ok(lines.clone()),
            None => Err(BackendError::NotReady {
                attempts: 30,
                last_error: "connection refused".to_string(),
            }),
        }
    }
}

/// An orchestrator over fakes, with its directories in a temp dir.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub automation: Arc<FakeAutomation>,
    pub accelerated: Arc<FakeAccelerated>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(
        preferred: BackendKind,
        reading: ResourceReading,
        behavior: AutomationBehavior,
        accelerated: FakeAccelerated,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::new(dir.path().join("uploads"));
        let artifacts = ArtifactStore::new(dir.path().join("output"));

        let automation = Arc::new(FakeAutomation::new(behavior, artifacts.clone()));
        let accelerated = Arc::new(accelerated);
        let orchestrator = Orchestrator::new(
            Arc::new(FixedProbe(reading)),
            automation.clone(),
            accelerated.clone(),
            scratch,
            artifacts,
        )
        .with_preferred(preferred)
        .with_threshold_mib(1000);

        Self {
            orchestrator: Arc::new(orchestrator),
            automation,
            accelerated,
            _dir: dir,
        }
    }
}

/// True when no staged upload remains in the harness's scratch directory.
pub fn scratch_is_empty(harness: &Harness) -> bool {
    match std::fs::read_dir(harness.orchestrator.scratch().path()) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
