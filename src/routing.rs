//! Backend routing policy.
//!
//! Decides per request which backend handles it. The accelerated path is only
//! declined up front when headroom was measured and is below the threshold;
//! an unmeasurable reading counts as enough headroom, leaving the accelerated
//! backend's own readiness retry to fail fast when the service is down.

use crate::backend::{BackendKind, RenderMode};
use crate::probe::ResourceReading;

/// Why a backend was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// The preferred backend was used as configured.
    Preferred,
    /// Accelerated was preferred but headroom was below the threshold.
    InsufficientHeadroom,
}

/// Result of routing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub backend: BackendKind,
    pub reason: RouteReason,
}

/// Choose the backend for a request.
pub fn choose(preferred: BackendKind, reading: ResourceReading, threshold_mib: u64) -> BackendKind {
    route(preferred, reading, threshold_mib).backend
}

/// Choose the backend for a request, keeping the reason for logging.
pub fn route(preferred: BackendKind, reading: ResourceReading, threshold_mib: u64) -> Route {
    match (preferred, reading.free_mib) {
        (BackendKind::Accelerated, Some(free)) if free < threshold_mib => Route {
            backend: BackendKind::Automation,
            reason: RouteReason::InsufficientHeadroom,
        },
        (backend, _) => Route {
            backend,
            reason: RouteReason::Preferred,
        },
    }
}

/// Rendering hint for the automation pipeline.
///
/// GPU only with measured headroom at or above the threshold.
pub fn render_mode(reading: ResourceReading, threshold_mib: u64) -> RenderMode {
    match reading.free_mib {
        Some(free) if free >= threshold_mib => RenderMode::Gpu,
        _ => RenderMode::Cpu,
    }
}
