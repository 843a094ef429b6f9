//! Accelerated OCR backend implementation.
//!
//! Talks to a remote OCR service exposing:
//! - `GET /health`: readiness signal
//! - `POST /ocr`: multipart `image` upload, answers `{"lines": [...]}`
//!
//! The service loads its model lazily (possibly downloading weights on the
//! first call), so a passing health check does not mean the first OCR call
//! will succeed. Both phases are bounded retry loops with a fixed interval.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AcceleratedBackend, BackendError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempt counts and intervals for the two phases of a call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum health probes before giving up on readiness.
    pub health_attempts: u32,
    /// Pause between failed health probes.
    pub health_interval: Duration,
    /// Per-probe request timeout.
    pub health_timeout: Duration,
    /// Maximum OCR calls before reporting failure.
    pub ocr_attempts: u32,
    /// Pause between failed OCR calls.
    pub ocr_interval: Duration,
    /// Per-call OCR timeout (long enough for a first-run model load).
    pub ocr_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            health_attempts: 30,
            health_interval: Duration::from_secs(1),
            health_timeout: Duration::from_secs(1),
            ocr_attempts: 10,
            ocr_interval: Duration::from_secs(1),
            ocr_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    lines: Vec<String>,
}

/// Accelerated backend using the remote OCR service.
pub struct HttpAcceleratedBackend {
    base_url: String,
    client: Client,
    policy: RetryPolicy,
}

impl HttpAcceleratedBackend {
    /// Create a backend for the service at `base_url` (e.g. `http://fir-ocr-gpu:9000`).
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            policy: RetryPolicy::default(),
        })
    }

    /// Set the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Poll `/health` until it answers with a success status.
    async fn wait_until_ready(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        let mut last_error = String::from("no health check attempted");

        for attempt in 1..=self.policy.health_attempts {
            match self
                .client
                .get(&url)
                .timeout(self.policy.health_timeout)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!("OCR service ready after {} health check(s)", attempt);
                    return Ok(());
                }
                Ok(resp) => last_error = format!("health check returned {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }

            debug!(
                "OCR service not ready (attempt {}/{}): {}",
                attempt, self.policy.health_attempts, last_error
            );
            if attempt < self.policy.health_attempts {
                tokio::time::sleep(self.policy.health_interval).await;
            }
        }

        Err(BackendError::NotReady {
            attempts: self.policy.health_attempts,
            last_error,
        })
    }

    /// Single OCR call. Any failure is reported as a message for the retry loop.
    async fn ocr_once(&self, image: &[u8], file_name: &str, mime: &str) -> Result<Vec<String>, String> {
        let part = Part::bytes(image.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| format!("invalid image mime type: {}", e))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .multipart(form)
            .timeout(self.policy.ocr_timeout)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("OCR service error ({}): {}", status, body.trim()));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse response: {}", e))?;
        Ok(parsed.lines)
    }
}

#[async_trait]
impl AcceleratedBackend for HttpAcceleratedBackend {
    async fn recognize(&self, image: &Path) -> Result<Vec<String>, BackendError> {
        let start = Instant::now();
        self.wait_until_ready().await?;

        let bytes = tokio::fs::read(image).await?;
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let mime = mime_guess::from_path(image).first_or_octet_stream();

        let mut last_error = String::from("no OCR attempt made");
        for attempt in 1..=self.policy.ocr_attempts {
            match self.ocr_once(&bytes, &file_name, mime.as_ref()).await {
                Ok(lines) => {
                    info!(
                        "OCR service returned {} lines in {}ms",
                        lines.len(),
                        start.elapsed().as_millis()
                    );
                    return Ok(lines);
                }
                Err(e) => {
                    warn!(
                        "OCR call failed (attempt {}/{}): {}",
                        attempt, self.policy.ocr_attempts, e
                    );
                    last_error = e;
                }
            }

            if attempt < self.policy.ocr_attempts {
                tokio::time::sleep(self.policy.ocr_interval).await;
            }
        }

        Err(BackendError::OcrFailed {
            attempts: self.policy.ocr_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.health_attempts, 30);
        assert_eq!(policy.health_interval, Duration::from_secs(1));
        assert_eq!(policy.ocr_attempts, 10);
        assert_eq!(policy.ocr_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = HttpAcceleratedBackend::new("http://fir-ocr-gpu:9000/").unwrap();
        assert_eq!(backend.base_url(), "http://fir-ocr-gpu:9000");
    }

    #[test]
    fn test_response_without_lines_is_empty() {
        let parsed: OcrResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.lines.is_empty());

        let parsed: OcrResponse = serde_json::from_str(r#"{"lines": ["abc", "def"]}"#).unwrap();
        assert_eq!(parsed.lines, vec!["abc", "def"]);
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_readiness() {
        // Port 9 (discard) on loopback is closed in test environments.
        let backend = HttpAcceleratedBackend::new("http://127.0.0.1:9")
            .unwrap()
            .with_policy(RetryPolicy {
                health_attempts: 2,
                health_interval: Duration::from_millis(10),
                health_timeout: Duration::from_millis(200),
                ..RetryPolicy::default()
            });

        let err = backend
            .recognize(Path::new("/nonexistent.png"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackendError::NotReady { attempts: 2, .. }),
            "unexpected error: {:?}",
            err
        );
    }
}
