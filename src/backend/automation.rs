//! Automation backend implementation.
//!
//! Drives the headless rendering pipeline (`node headless_process.js` by
//! default) as a single bounded-duration subprocess. The pipeline receives
//! four positional arguments (image path, label, stockpile, version) and
//! writes its TSV report into the shared output directory; it does not hand
//! the table back over stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AutomationBackend, AutomationJob, BackendError, Diagnostics};
use crate::artifact::ArtifactStore;

/// Maximum bytes of stdout/stderr kept for error payloads.
pub const DIAGNOSTIC_TAIL_BYTES: usize = 2000;

/// How long to wait for output readers after the process has exited.
/// Helpers spawned by the pipeline can hold the pipes open past its exit.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Tolerance for coarse filesystem timestamps when judging report freshness.
const MTIME_SLACK: Duration = Duration::from_secs(2);

type TailBuffer = Arc<Mutex<Vec<u8>>>;

/// Automation backend using a subprocess.
pub struct ProcessAutomationBackend {
    /// Program to execute (e.g. `node`).
    program: PathBuf,
    /// Arguments placed before the four job arguments (e.g. the script path).
    leading_args: Vec<String>,
    /// Working directory for the pipeline, if not inherited.
    working_dir: Option<PathBuf>,
    /// Hard limit on process runtime.
    timeout: Duration,
    artifacts: ArtifactStore,
}

impl ProcessAutomationBackend {
    /// Create a backend that runs `program` and looks for reports in `artifacts`.
    pub fn new(program: impl Into<PathBuf>, artifacts: ArtifactStore) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            artifacts,
        }
    }

    /// Set the arguments passed before the job arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory of the pipeline.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the process timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check if the pipeline program can be found.
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok() || self.program.exists()
    }

    /// Get a description of what's needed to make this backend available.
    pub fn availability_hint(&self) -> String {
        if self.is_available() {
            format!(
                "Automation pipeline is available ({} {})",
                self.program.display(),
                self.leading_args.join(" ")
            )
        } else {
            format!(
                "'{}' not found in PATH. Install Node.js and the pipeline's Playwright dependencies.",
                self.program.display()
            )
        }
    }

    fn command(&self, job: &AutomationJob<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(job.image)
            .arg(job.label)
            .arg(job.stockpile)
            .arg(job.version)
            .env("FIR_RENDER_MODE", job.render_mode.as_str())
            .env("FIR_OCR_BACKEND", "browser")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group, so a timeout can take down the browser it launches.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[async_trait]
impl AutomationBackend for ProcessAutomationBackend {
    async fn run(&self, job: &AutomationJob<'_>) -> Result<PathBuf, BackendError> {
        let start = Instant::now();
        let started_at = SystemTime::now();
        info!(
            "Starting automation pipeline for label '{}' (render mode {}, timeout {:?})",
            job.label,
            job.render_mode.as_str(),
            self.timeout
        );

        let mut child = self
            .command(job)
            .spawn()
            .map_err(|source| BackendError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdout_buf = TailBuffer::default();
        let stderr_buf = TailBuffer::default();
        let stdout_task = spawn_tail_reader(child.stdout.take(), stdout_buf.clone());
        let stderr_task = spawn_tail_reader(child.stderr.take(), stderr_buf.clone());

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                terminate(&mut child).await;
                let diagnostics =
                    drain(stdout_task, &stdout_buf, stderr_task, &stderr_buf).await;
                warn!(
                    "Automation pipeline exceeded {:?} and was terminated",
                    self.timeout
                );
                return Err(BackendError::TimedOut {
                    timeout: self.timeout,
                    diagnostics,
                });
            }
        };

        let diagnostics = drain(stdout_task, &stdout_buf, stderr_task, &stderr_buf).await;
        let elapsed = start.elapsed();

        if !status.success() {
            warn!(
                "Automation pipeline failed after {}ms: {}",
                elapsed.as_millis(),
                status
            );
            return Err(BackendError::ProcessFailed {
                code: status.code(),
                diagnostics,
            });
        }

        let expected = self.artifacts.path_for(job.label);
        if !written_since(&expected, started_at).await? {
            warn!(
                "Automation pipeline exited cleanly but did not write {}",
                expected.display()
            );
            return Err(BackendError::ArtifactMissing {
                expected,
                diagnostics,
            });
        }

        info!(
            "Automation pipeline finished in {}ms: {}",
            elapsed.as_millis(),
            expected.display()
        );
        Ok(expected)
    }
}

/// Whether `path` exists and was modified after `since`.
///
/// A report left by an earlier run under the same label does not count.
async fn written_since(path: &Path, since: SystemTime) -> std::io::Result<bool> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    // Without mtime support only existence can be checked.
    let Ok(modified) = metadata.modified() else {
        return Ok(true);
    };
    Ok(modified + MTIME_SLACK >= since)
}

/// Kill the pipeline's whole process group, then reap the direct child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall; a negative pid addresses the group made at spawn.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "killpg({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to reap automation process: {}", e);
    }
}

fn spawn_tail_reader<R>(reader: Option<R>, buf: TailBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut tail = buf.lock().unwrap_or_else(|e| e.into_inner());
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > DIAGNOSTIC_TAIL_BYTES * 2 {
                        let excess = tail.len() - DIAGNOSTIC_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
            }
        }
    })
}

async fn drain(
    stdout_task: JoinHandle<()>,
    stdout_buf: &TailBuffer,
    stderr_task: JoinHandle<()>,
    stderr_buf: &TailBuffer,
) -> Diagnostics {
    let deadline = tokio::time::sleep(DRAIN_GRACE);
    tokio::pin!(deadline);

    for mut task in [stdout_task, stderr_task] {
        tokio::select! {
            _ = &mut task => {}
            _ = &mut deadline => task.abort(),
        }
    }

    Diagnostics {
        stdout_tail: tail_string(stdout_buf),
        stderr_tail: tail_string(stderr_buf),
    }
}

fn tail_string(buf: &TailBuffer) -> String {
    let bytes = buf.lock().unwrap_or_else(|e| e.into_inner());
    truncate_tail(&bytes, DIAGNOSTIC_TAIL_BYTES)
}

/// Keep at most `limit` trailing bytes, starting on a UTF-8 character boundary.
fn truncate_tail(bytes: &[u8], limit: usize) -> String {
    let mut start = bytes.len().saturating_sub(limit);
    while start < bytes.len() && (bytes[start] & 0xC0) == 0x80 {
        start += 1;
    }
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::backend::RenderMode;
    use std::path::Path;
    use tempfile::TempDir;

    /// Backend running an inline shell script; job arguments arrive as $1..$4.
    fn shell_backend(script: &str, output_dir: &Path) -> ProcessAutomationBackend {
        ProcessAutomationBackend::new("sh", ArtifactStore::new(output_dir))
            .with_args(["-c", script, "automation"])
            .with_timeout(Duration::from_secs(10))
    }

    /// Whether `pid` names a live (non-zombie) process.
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // State is the first field after the parenthesised command name.
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    fn job<'a>(image: &'a Path, label: &'a str) -> AutomationJob<'a> {
        AutomationJob {
            image,
            label,
            stockpile: "Public",
            version: "airborne-63",
            render_mode: RenderMode::Cpu,
        }
    }

    #[test]
    fn test_truncate_tail_keeps_last_bytes() {
        let data = b"0123456789";
        assert_eq!(truncate_tail(data, 4), "6789");
        assert_eq!(truncate_tail(data, 100), "0123456789");
    }

    #[test]
    fn test_truncate_tail_skips_partial_character() {
        // "é" is two bytes; cutting inside it must not yield a replacement char.
        let data = "aéb".as_bytes();
        assert_eq!(truncate_tail(data, 2), "b");
        assert_eq!(truncate_tail(data, 3), "éb");
    }

    #[tokio::test]
    async fn test_success_returns_artifact_path() {
        let out = TempDir::new().unwrap();
        let script = format!(
            "printf 'Stockpile Title\\tQuantity\\n' > '{}/tine_report.tsv'",
            out.path().display()
        );
        let backend = shell_backend(&script, out.path());
        let image = out.path().join("in.png");

        let path = backend.run(&job(&image, "tine")).await.unwrap();
        assert_eq!(path, out.path().join("tine_report.tsv"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_positional_arguments_and_environment() {
        let out = TempDir::new().unwrap();
        let script = format!(
            "echo \"$1|$2|$3|$4|$FIR_RENDER_MODE|$FIR_OCR_BACKEND\" > '{}/args_report.tsv'",
            out.path().display()
        );
        let backend = shell_backend(&script, out.path());
        let image = PathBuf::from("/tmp/abc_in.png");
        let mut job = job(&image, "args");
        job.render_mode = RenderMode::Gpu;

        let path = backend.run(&job).await.unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            written.trim(),
            "/tmp/abc_in.png|args|Public|airborne-63|gpu|browser"
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_diagnostics() {
        let out = TempDir::new().unwrap();
        let backend = shell_backend("echo progress; echo 'page crashed' >&2; exit 1", out.path());
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "tine")).await.unwrap_err();
        match err {
            BackendError::ProcessFailed { code, diagnostics } => {
                assert_eq!(code, Some(1));
                assert_eq!(diagnostics.stdout_tail.trim(), "progress");
                assert_eq!(diagnostics.stderr_tail.trim(), "page crashed");
            }
            other => panic!("expected ProcessFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_diagnostics_are_bounded() {
        let out = TempDir::new().unwrap();
        let backend = shell_backend(
            "i=0; while [ $i -lt 2000 ]; do echo 'line of noisy stderr output' >&2; i=$((i+1)); done; exit 3",
            out.path(),
        );
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "tine")).await.unwrap_err();
        let diagnostics = err.diagnostics().unwrap();
        assert!(diagnostics.stderr_tail.len() <= DIAGNOSTIC_TAIL_BYTES);
        assert!(diagnostics.stderr_tail.ends_with("line of noisy stderr output\n"));
    }

    #[tokio::test]
    async fn test_clean_exit_without_artifact_is_reported() {
        let out = TempDir::new().unwrap();
        let backend = shell_backend("echo done", out.path());
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "Missing Label")).await.unwrap_err();
        match err {
            BackendError::ArtifactMissing { expected, .. } => {
                assert_eq!(expected, out.path().join("missing_label_report.tsv"));
            }
            other => panic!("expected ArtifactMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_report_from_earlier_run_is_not_accepted() {
        let out = TempDir::new().unwrap();
        let stale = out.path().join("tine_report.tsv");
        std::fs::write(&stale, "Stockpile Title\tQuantity\nold\t1\n").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        let backend = shell_backend("echo done", out.path());
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "Tine")).await.unwrap_err();
        match err {
            BackendError::ArtifactMissing { expected, diagnostics } => {
                assert_eq!(expected, stale);
                assert_eq!(diagnostics.stdout_tail, "done\n");
            }
            other => panic!("expected ArtifactMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rewritten_report_is_accepted() {
        let out = TempDir::new().unwrap();
        let report = out.path().join("tine_report.tsv");
        std::fs::write(&report, "old\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&report)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let script = format!("printf 'new\\n' > '{}'", report.display());
        let backend = shell_backend(&script, out.path());
        let image = out.path().join("in.png");

        let path = backend.run(&job(&image, "Tine")).await.unwrap();
        assert_eq!(path, report);
        assert_eq!(std::fs::read_to_string(&report).unwrap(), "new\n");
    }

    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let out = TempDir::new().unwrap();
        let pid_file = out.path().join("pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let backend =
            shell_backend(&script, out.path()).with_timeout(Duration::from_millis(500));
        let image = out.path().join("in.png");

        let started = Instant::now();
        let err = backend.run(&job(&image, "tine")).await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        assert!(!is_running(pid), "automation process {} still running", pid);
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let out = TempDir::new().unwrap();
        let pid_file = out.path().join("grandchild");
        let script = format!(
            "sleep 30 & echo $! > '{}'; wait",
            pid_file.display()
        );
        let backend =
            shell_backend(&script, out.path()).with_timeout(Duration::from_millis(500));
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "tine")).await.unwrap_err();
        assert!(err.is_timeout());

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        // SIGKILL delivery to a reparented helper is asynchronous.
        let mut alive = true;
        for _ in 0..50 {
            if !is_running(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "pipeline helper {} outlived the timeout", pid);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let out = TempDir::new().unwrap();
        let backend = ProcessAutomationBackend::new(
            "definitely-not-a-real-pipeline-binary",
            ArtifactStore::new(out.path()),
        );
        assert!(!backend.is_available());
        let image = out.path().join("in.png");

        let err = backend.run(&job(&image, "tine")).await.unwrap_err();
        assert!(matches!(err, BackendError::Launch { .. }));
    }
}
