//! Output artifact store.
//!
//! The canonical artifact is a TSV report whose location is derived from the
//! request label alone. The directory is shared process-wide: two requests
//! with the same label resolve to the same file and the last writer wins.
//! All naming goes through [`ArtifactStore::path_for`] so a uniqueness suffix
//! can be introduced here without touching the backends.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Suffix appended to the sanitised label.
pub const REPORT_SUFFIX: &str = "_report.tsv";

/// Header of a report synthesized from recognized text lines.
pub const LINES_HEADER: &str = "text";

/// Character substituted for anything that is not an ASCII letter or digit.
const FILLER: char = '_';

/// Shared directory of TSV reports.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory if it does not exist.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Report path for a label. Pure function of the label string.
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(report_file_name(label))
    }

    /// Write a single-column report built from recognized lines.
    pub async fn write_lines(&self, label: &str, lines: &[String]) -> std::io::Result<PathBuf> {
        self.ensure_dir().await?;
        let path = self.path_for(label);
        tokio::fs::write(&path, render_lines_tsv(lines)).await?;
        debug!("Wrote {} rows to {}", lines.len(), path.display());
        Ok(path)
    }
}

/// File name for a label: lower-cased, non-alphanumerics mapped to `_`.
pub fn report_file_name(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                FILLER
            }
        })
        .collect();
    format!("{}{}", safe, REPORT_SUFFIX)
}

/// Render lines as a TSV table with a `text` header, one line per row.
pub fn render_lines_tsv(lines: &[String]) -> String {
    let mut out = String::new();
    out.push_str(LINES_HEADER);
    out.push('\n');
    for line in lines {
        out.push_str(&sanitize_field(line));
        out.push('\n');
    }
    out
}

/// Replace characters that would break the one-field-per-row structure.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\r', '\n'], " ")
}
