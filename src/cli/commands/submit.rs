//! Upload client for a running service.

use std::time::Duration;

use anyhow::{bail, Context};
use console::style;
use reqwest::multipart::{Form, Part};

use super::SubmitArgs;

const DEFAULT_PORT: u16 = 5000;

/// Upload an image and save or print the returned report.
pub async fn cmd_submit(args: &SubmitArgs) -> anyhow::Result<()> {
    let url = process_url(&args.server);
    let data = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("reading {}", args.image.display()))?;
    let file_name = args
        .image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let mime = mime_guess::from_path(&args.image)
        .first_or_octet_stream()
        .to_string();

    let mut form = Form::new().part(
        "image",
        Part::bytes(data).file_name(file_name).mime_str(&mime)?,
    );
    if let Some(ref label) = args.label {
        form = form.text("label", label.clone());
    }
    if let Some(ref stockpile) = args.stockpile {
        form = form.text("stockpile", stockpile.clone());
    }
    if let Some(ref version) = args.game_version {
        form = form.text("version", version.clone());
    }

    println!(
        "{} Uploading {} to {}",
        style("→").cyan(),
        args.image.display(),
        url
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()?;
    let response = client
        .post(&url)
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("sending request to {}", url))?;

    let status = response.status();
    let backend = response
        .headers()
        .get(crate::server::BACKEND_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;

    if !status.is_success() {
        eprintln!("  {} Server returned {}", style("✗").red(), status);
        eprintln!("{}", describe_error(&body));
        bail!("processing failed with status {}", status);
    }

    let rows = count_rows(&body);
    match args.output {
        Some(ref path) => {
            tokio::fs::write(path, &body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!(
                "  {} {} rows via {} backend, saved to {}",
                style("✓").green(),
                rows,
                backend.as_deref().unwrap_or("unknown"),
                path.display()
            );
        }
        None => {
            print!("{}", body);
            eprintln!(
                "  {} {} rows via {} backend",
                style("✓").green(),
                rows,
                backend.as_deref().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}

/// Resolve a server argument into the full `/process` URL.
fn process_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    let base = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else if server.contains(':') {
        format!("http://{}", server)
    } else {
        format!("http://{}:{}", server, DEFAULT_PORT)
    };

    if base.ends_with("/process") {
        base
    } else {
        format!("{}/process", base)
    }
}

/// Data rows in a TSV report, excluding the header.
fn count_rows(tsv: &str) -> usize {
    tsv.lines()
        .filter(|line| !line.trim().is_empty())
        .count()
        .saturating_sub(1)
}

/// Render a structured error body for the terminal.
fn describe_error(body: &str) -> String {
    let json: serde_json::Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(_) => return body.to_string(),
    };

    let mut out = format!(
        "  error: {}",
        json["error"].as_str().unwrap_or("unknown error")
    );
    for key in ["code", "backend", "fallback_from", "fallback_reason", "request_id"] {
        if let Some(value) = json[key].as_str() {
            out.push_str(&format!("\n  {}: {}", key, value));
        }
    }
    if let Some(gpu_mode) = json["gpu_mode"].as_bool() {
        out.push_str(&format!("\n  gpu_mode: {}", gpu_mode));
    }
    for key in ["stdout_tail", "stderr_tail"] {
        if let Some(tail) = json[key].as_str().filter(|t| !t.trim().is_empty()) {
            out.push_str(&format!("\n  {}:\n{}", key, tail.trim_end()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_url() {
        assert_eq!(process_url("localhost"), "http://localhost:5000/process");
        assert_eq!(process_url("10.0.0.2:8080"), "http://10.0.0.2:8080/process");
        assert_eq!(
            process_url("https://ocr.example.com/"),
            "https://ocr.example.com/process"
        );
        assert_eq!(
            process_url("http://host:5000/process"),
            "http://host:5000/process"
        );
    }

    #[test]
    fn test_count_rows() {
        assert_eq!(count_rows("text\nabc\ndef\n"), 2);
        assert_eq!(count_rows("text\n"), 0);
        assert_eq!(count_rows(""), 0);
    }

    #[test]
    fn test_describe_error() {
        let body = r#"{"error":"TSV not found after processing","code":"ARTIFACT_MISSING","gpu_mode":false,"stderr_tail":"boom\n"}"#;
        let out = describe_error(body);
        assert!(out.contains("TSV not found after processing"));
        assert!(out.contains("gpu_mode: false"));
        assert!(out.contains("boom"));
        assert_eq!(describe_error("Bad Gateway"), "Bad Gateway");
    }
}
