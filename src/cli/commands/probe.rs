//! Resource probe command.

use console::style;

use crate::backend::BackendKind;
use crate::config::Settings;
use crate::probe::ResourceProbe;
use crate::routing::{self, RouteReason};

/// Print the current headroom reading and where a request would go.
pub async fn cmd_probe(settings: &Settings) -> anyhow::Result<()> {
    let reading = settings.probe().read().await;
    let route = routing::route(settings.backend, reading, settings.min_free_mb);
    let render_mode = routing::render_mode(reading, settings.min_free_mb);

    match reading.free_mib {
        Some(_) => println!("{} Accelerator: {}", style("✓").green(), reading),
        None => println!(
            "{} Accelerator: {} ({} unavailable or failed)",
            style("!").yellow(),
            reading,
            settings.vram_probe.display()
        ),
    }
    println!("  Threshold:  {} MiB", settings.min_free_mb);
    println!("  Preferred:  {}", settings.backend);

    let note = match route.reason {
        RouteReason::Preferred => "as configured",
        RouteReason::InsufficientHeadroom => "headroom below threshold",
    };
    println!("  Route:      {} ({})", style(route.backend).bold(), note);
    if route.backend == BackendKind::Automation {
        println!("  Render:     {}", render_mode.as_str());
    }

    Ok(())
}
