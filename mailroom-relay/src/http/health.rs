//! Health and readiness endpoints.

use crate::hub::RelayHub;
use axum::{http::StatusCode, Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `"ok"`, or `"shutting_down"` once the hub stops accepting work.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Registered connections.
    pub connections: usize,
    /// Envelopes waiting for an offline recipient.
    pub queued: usize,
    /// Seconds since the hub was created.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the hub.
    pub fn of(hub: &RelayHub) -> Self {
        Self {
            status: if hub.is_accepting() { "ok" } else { "shutting_down" },
            version: env!("CARGO_PKG_VERSION"),
            connections: hub.connection_count(),
            queued: hub.queued_count(),
            uptime_seconds: hub.uptime().as_secs(),
        }
    }
}

/// Body of `GET /ready`.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    /// Whether the hub accepts work.
    pub ready: bool,
    /// Registered connections.
    pub connections: usize,
}

/// Liveness plus a few gauges.
pub async fn health_handler(Extension(hub): Extension<Arc<RelayHub>>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&hub))
}

/// 200 while the hub accepts work, 503 after shutdown.
pub async fn ready_handler(
    Extension(hub): Extension<Arc<RelayHub>>,
) -> (StatusCode, Json<Readiness>) {
    let ready = hub.is_accepting();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(Readiness {
            ready,
            connections: hub.connection_count(),
        }),
    )
}
