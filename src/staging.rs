//! Scratch staging for uploaded images.
//!
//! Each upload is written under a freshly generated name and owned by a
//! [`StagedUpload`] guard. Dropping the guard removes the file, so cleanup
//! runs exactly once on every exit path, including unwinding.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Attempts at finding an unused name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 8;

/// Directory where uploads are staged for the duration of a request.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Create the scratch directory if it does not exist.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Write `data` to a new, never-reused file in the scratch directory.
    pub async fn stage(&self, original_name: Option<&str>, data: &[u8]) -> std::io::Result<StagedUpload> {
        self.ensure_dir().await?;
        let safe_name = sanitize_filename(original_name.unwrap_or_default());

        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self.dir.join(format!("{}_{}", short_token(), safe_name));
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };

            // Guard first: a failed write still removes the partial file.
            let staged = StagedUpload { path };
            file.write_all(data).await?;
            file.flush().await?;
            debug!("Staged {} bytes at {}", data.len(), staged.path.display());
            return Ok(staged);
        }

        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            "could not find an unused scratch file name",
        ))
    }
}

/// An uploaded image owned by one request. Removed on drop.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged upload {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staged upload {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

fn short_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reduce an uploaded file name to a safe ASCII component.
pub fn sanitize_filename(name: &str) -> String {
    // Only the final path component of whatever the client sent.
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}
