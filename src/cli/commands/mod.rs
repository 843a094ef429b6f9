//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod probe;
mod serve;
mod submit;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "firgate")]
#[command(about = "OCR gateway for stockpile screenshots")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OCR HTTP service
    Serve(ServeArgs),

    /// Show the current accelerator headroom and the routing decision
    Probe {
        #[command(flatten)]
        settings: Settings,
    },

    /// Upload an image to a running service and save the returned report
    Submit(SubmitArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Bind address (port, host, or host:port)
    #[arg(short, long, env = "FIR_BIND", default_value = "0.0.0.0:5000")]
    pub bind: String,

    /// Maximum accepted upload size in MiB
    #[arg(long, env = "FIR_MAX_UPLOAD_MB", default_value_t = 25)]
    pub max_upload_mb: usize,

    /// Static site directory to serve on --site-bind
    #[arg(long, env = "FIR_SITE_DIR")]
    pub site_dir: Option<PathBuf>,

    /// Bind address for the static site
    #[arg(long, env = "FIR_SITE_BIND", default_value = "0.0.0.0:8005")]
    pub site_bind: String,

    #[command(flatten)]
    pub settings: Settings,
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Server address (host, host:port, or URL)
    pub server: String,

    /// Image to upload
    pub image: PathBuf,

    /// Report label
    #[arg(short, long)]
    pub label: Option<String>,

    /// Stockpile name
    #[arg(short, long)]
    pub stockpile: Option<String>,

    /// Game version
    #[arg(long = "game-version")]
    pub game_version: Option<String>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve::cmd_serve(&args).await,
        Commands::Probe { settings } => probe::cmd_probe(&settings).await,
        Commands::Submit(args) => submit::cmd_submit(&args).await,
    }
}
