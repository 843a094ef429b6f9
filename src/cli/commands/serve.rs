//! Web server command.

use std::net::SocketAddr;

use anyhow::Context;
use console::style;

use super::ServeArgs;
use crate::server::ServerOptions;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_SITE_PORT: u16 = 8005;

/// Start the web server.
pub async fn cmd_serve(args: &ServeArgs) -> anyhow::Result<()> {
    let (host, port) = parse_bind_address(&args.bind, DEFAULT_PORT)?;
    let (site_host, site_port) = parse_bind_address(&args.site_bind, DEFAULT_SITE_PORT)?;

    let options = ServerOptions {
        addr: socket_addr(&host, port)?,
        max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
        site_dir: args.site_dir.clone(),
        site_addr: socket_addr(&site_host, site_port)?,
    };

    println!(
        "{} Starting OCR service at http://{}:{} ({} backend preferred)",
        style("→").cyan(),
        host,
        port,
        args.settings.backend
    );
    if let Some(ref dir) = options.site_dir {
        println!(
            "  {} Serving {} at http://{}:{}",
            style("✓").green(),
            dir.display(),
            site_host,
            site_port
        );
    }
    println!("  Press Ctrl+C to stop");

    crate::server::serve(&args.settings, &options).await
}

fn socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", host, port))
}

/// Parse a bind address that can be:
/// - Just a port: "5000" -> 127.0.0.1:5000
/// - Just a host: "0.0.0.0" -> 0.0.0.0:<default>
/// - Host and port: "0.0.0.0:5000" -> 0.0.0.0:5000
fn parse_bind_address(bind: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    if let Ok(port) = bind.parse::<u16>() {
        return Ok(("127.0.0.1".to_string(), port));
    }

    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }

    Ok((bind.to_string(), default_port))
}
