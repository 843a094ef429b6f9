//! Service configuration.
//!
//! Every setting is environment-sourced (after `.env` loading) and can be
//! overridden on the command line. All values are optional with defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::artifact::ArtifactStore;
use crate::backend::{BackendKind, HttpAcceleratedBackend, ProcessAutomationBackend, RetryPolicy};
use crate::orchestrator::Orchestrator;
use crate::probe::NvidiaSmiProbe;
use crate::staging::ScratchDir;

/// Default accelerated OCR service address.
pub const DEFAULT_GPU_URL: &str = "http://fir-ocr-gpu:9000";

/// Default free-memory threshold for using the accelerated backend.
pub const DEFAULT_MIN_FREE_MIB: u64 = 1000;

/// Default automation process timeout in seconds.
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 180;

/// Routing and backend settings.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Preferred OCR backend
    #[arg(long, env = "FIR_OCR_BACKEND", value_enum, ignore_case = true, default_value = "browser")]
    pub backend: BackendKind,

    /// Base URL of the accelerated OCR service
    #[arg(long, env = "FIR_GPU_OCR_URL", default_value = DEFAULT_GPU_URL)]
    pub gpu_url: String,

    /// Minimum free accelerator memory (MiB) required to use the accelerated backend
    #[arg(long, env = "FIR_GPU_MIN_FREE_MB", default_value_t = DEFAULT_MIN_FREE_MIB)]
    pub min_free_mb: u64,

    /// Automation process timeout in seconds
    #[arg(long, env = "FIR_PROCESS_TIMEOUT", default_value_t = DEFAULT_PROCESS_TIMEOUT_SECS)]
    pub process_timeout: u64,

    /// Per-attempt timeout for accelerated OCR calls, in seconds
    #[arg(long, env = "FIR_GPU_OCR_TIMEOUT", default_value_t = 180)]
    pub gpu_timeout: u64,

    /// Scratch directory for staged uploads
    #[arg(long, env = "FIR_UPLOAD_DIR", default_value = "/tmp/fir_uploads")]
    pub upload_dir: PathBuf,

    /// Directory the automation pipeline writes reports into
    #[arg(long, env = "FIR_OUTPUT_DIR", default_value = "/app/sample_output")]
    pub output_dir: PathBuf,

    /// Program that runs the automation pipeline
    #[arg(long, env = "FIR_AUTOMATION_PROGRAM", default_value = "node")]
    pub automation_program: PathBuf,

    /// Pipeline script passed as the program's first argument (empty for none)
    #[arg(long, env = "FIR_AUTOMATION_SCRIPT", default_value = "headless_process.js")]
    pub automation_script: String,

    /// Working directory for the automation pipeline
    #[arg(long, env = "FIR_AUTOMATION_DIR")]
    pub automation_dir: Option<PathBuf>,

    /// Command used to query free accelerator memory
    #[arg(long, env = "FIR_VRAM_PROBE", default_value = "nvidia-smi")]
    pub vram_probe: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Automation,
            gpu_url: DEFAULT_GPU_URL.to_string(),
            min_free_mb: DEFAULT_MIN_FREE_MIB,
            process_timeout: DEFAULT_PROCESS_TIMEOUT_SECS,
            gpu_timeout: 180,
            upload_dir: PathBuf::from("/tmp/fir_uploads"),
            output_dir: PathBuf::from("/app/sample_output"),
            automation_program: PathBuf::from("node"),
            automation_script: "headless_process.js".to_string(),
            automation_dir: None,
            vram_probe: PathBuf::from("nvidia-smi"),
        }
    }
}

impl Settings {
    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.output_dir)
    }

    pub fn scratch_dir(&self) -> ScratchDir {
        ScratchDir::new(&self.upload_dir)
    }

    pub fn probe(&self) -> NvidiaSmiProbe {
        NvidiaSmiProbe::with_binary(&self.vram_probe)
    }

    pub fn automation_backend(&self) -> ProcessAutomationBackend {
        let mut backend =
            ProcessAutomationBackend::new(&self.automation_program, self.artifact_store())
                .with_timeout(Duration::from_secs(self.process_timeout));
        if !self.automation_script.is_empty() {
            backend = backend.with_args([self.automation_script.clone()]);
        }
        if let Some(ref dir) = self.automation_dir {
            backend = backend.with_working_dir(dir);
        }
        backend
    }

    pub fn accelerated_backend(&self) -> reqwest::Result<HttpAcceleratedBackend> {
        let policy = RetryPolicy {
            ocr_timeout: Duration::from_secs(self.gpu_timeout),
            ..RetryPolicy::default()
        };
        Ok(HttpAcceleratedBackend::new(&self.gpu_url)?.with_policy(policy))
    }

    /// Wire the production probe and backends into an orchestrator.
    pub fn build_orchestrator(&self) -> anyhow::Result<Orchestrator> {
        Ok(Orchestrator::new(
            Arc::new(self.probe()),
            Arc::new(self.automation_backend()),
            Arc::new(self.accelerated_backend()?),
            self.scratch_dir(),
            self.artifact_store(),
        )
        .with_preferred(self.backend)
        .with_threshold_mib(self.min_free_mb))
    }
}
