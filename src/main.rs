//! firgate - OCR gateway for stockpile screenshots.
//!
//! Accepts image uploads over HTTP and returns a TSV stockpile report,
//! produced either by a local automation pipeline or a remote GPU OCR service.

use firgate::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "firgate=debug,tower_http=debug"
    } else {
        "firgate=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
