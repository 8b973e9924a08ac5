//! HTTP endpoints for mailroom-relay.
//!
//! Provides the WebSocket endpoint, health checks, metrics, and federation
//! ingress.

pub mod federation;
pub mod health;
mod metrics;
pub mod ws;

use crate::hub::RelayHub;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;

pub use federation::{FederationVerifier, PeerAllowList, SharedVerifier};
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
///
/// Federation uses a [`PeerAllowList`] built from the hub's config.
pub fn build_router(hub: Arc<RelayHub>) -> Router {
    let verifier: SharedVerifier = Arc::new(PeerAllowList::from_config(&hub.config().federation));
    build_router_with_verifier(hub, verifier)
}

/// Build the HTTP router with a custom federation verifier.
pub fn build_router_with_verifier(hub: Arc<RelayHub>, verifier: SharedVerifier) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::ready_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/federation/message", post(federation::message_handler))
        .route("/federation/discover", get(federation::discover_handler))
        .layer(Extension(verifier))
        .layer(Extension(hub))
}
