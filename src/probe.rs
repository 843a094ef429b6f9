//! Accelerator memory headroom probe.
//!
//! Reads free GPU memory via `nvidia-smi`. Any failure (tool absent, non-zero
//! exit, unparsable output, slow answer) yields an unmeasurable reading
//! instead of an error: a failed probe is routing information, not a fault.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on a probe; it runs on every request's critical path.
const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Free accelerator memory, if it could be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceReading {
    pub free_mib: Option<u64>,
}

impl ResourceReading {
    pub fn measured(free_mib: u64) -> Self {
        Self {
            free_mib: Some(free_mib),
        }
    }

    pub fn unknown() -> Self {
        Self { free_mib: None }
    }
}

impl fmt::Display for ResourceReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.free_mib {
            Some(mib) => write!(f, "{} MiB free", mib),
            None => write!(f, "unknown"),
        }
    }
}

/// Source of fresh resource readings. Never cached: headroom changes between requests.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn read(&self) -> ResourceReading;
}

/// Probe backed by `nvidia-smi --query-gpu=memory.free`.
pub struct NvidiaSmiProbe {
    binary: PathBuf,
    timeout: Duration,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    async fn query(&self) -> Option<u64> {
        let child = Command::new(&self.binary)
            .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                debug!("VRAM probe unavailable ({}): {}", self.binary.display(), e);
                return None;
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!("VRAM probe failed: {}", e);
                return None;
            }
            Err(_) => {
                debug!("VRAM probe exceeded {:?}", self.timeout);
                return None;
            }
        };

        if !output.status.success() {
            debug!("VRAM probe exited with {}", output.status);
            return None;
        }

        parse_free_mib(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for NvidiaSmiProbe {
    async fn read(&self) -> ResourceReading {
        ResourceReading {
            free_mib: self.query().await,
        }
    }
}

/// Parse the first device's free memory from `nvidia-smi` CSV output.
fn parse_free_mib(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(',').next())
        .and_then(|field| field.trim().parse().ok())
}
