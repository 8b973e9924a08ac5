//! Federation ingress.
//!
//! Peer relays POST envelopes for local recipients to `/federation/message`.
//! Whether a peer is trusted is decided by a [`FederationVerifier`]; the
//! default one checks the sender domain against `federation.peers`.

use crate::config::FederationConfig;
use crate::error::RelayError;
use crate::hub::{RelayHub, RouteOutcome};
use async_trait::async_trait;
use axum::{body::Bytes, http::StatusCode, response::IntoResponse, Extension, Json};
use mailroom_types::FederationEnvelope;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// Why a federated envelope was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The sender domain is not a configured peer.
    #[error("unknown peer relay: {0}")]
    UnknownPeer(String),
    /// No signature was supplied.
    #[error("missing signature")]
    MissingSignature,
}

/// Decides whether a peer relay may inject an envelope.
#[async_trait]
pub trait FederationVerifier: Send + Sync {
    /// Accept or refuse `envelope`.
    async fn verify(&self, envelope: &FederationEnvelope) -> Result<(), VerifyError>;
}

/// Accepts envelopes from configured peer domains that carry a signature.
///
/// Signature bytes are not checked cryptographically.
#[derive(Debug, Clone, Default)]
pub struct PeerAllowList {
    peers: HashSet<String>,
}

impl PeerAllowList {
    /// Build from the federation config.
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            peers: config.peers.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl FederationVerifier for PeerAllowList {
    async fn verify(&self, envelope: &FederationEnvelope) -> Result<(), VerifyError> {
        if !self.peers.contains(&envelope.sender_domain) {
            return Err(VerifyError::UnknownPeer(envelope.sender_domain.clone()));
        }
        if envelope.signature.is_empty() {
            return Err(VerifyError::MissingSignature);
        }
        Ok(())
    }
}

/// Shared verifier handle stored as a router extension.
pub type SharedVerifier = Arc<dyn FederationVerifier>;

/// Response body for an accepted federated envelope.
#[derive(Debug, Clone, Serialize)]
pub struct FederationAccepted {
    /// Always "accepted".
    pub status: &'static str,
    /// "delivered" or "queued".
    pub outcome: &'static str,
}

fn reject(code: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (code, Json(json!({ "error": message.into() }))).into_response()
}

/// `POST /federation/message`.
pub async fn message_handler(
    Extension(hub): Extension<Arc<RelayHub>>,
    Extension(verifier): Extension<SharedVerifier>,
    body: Bytes,
) -> axum::response::Response {
    if !hub.config().federation.enabled {
        return reject(StatusCode::NOT_FOUND, "federation is disabled");
    }
    if let Err(e) = hub.rate_limits().check_global() {
        hub.record_rate_limited();
        return reject(StatusCode::TOO_MANY_REQUESTS, e.to_string());
    }

    let fed: FederationEnvelope = match serde_json::from_slice(&body) {
        Ok(fed) => fed,
        Err(e) => return reject(StatusCode::BAD_REQUEST, format!("invalid envelope: {e}")),
    };

    if let Err(e) = verifier.verify(&fed).await {
        tracing::warn!("Refused federated envelope {} from {}: {}", fed.id, fed.sender_domain, e);
        return reject(StatusCode::UNAUTHORIZED, e.to_string());
    }

    let sender_domain = fed.sender_domain.clone();
    let envelope = match fed.into_envelope() {
        Ok(envelope) => envelope,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let limit = hub.config().limits.max_payload_size;
    if envelope.payload.len() > limit {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("payload too large: {} bytes (limit: {limit} bytes)", envelope.payload.len()),
        );
    }

    let message_id = envelope.id.clone();
    match hub.relay_federated(envelope) {
        Ok(outcome) => {
            tracing::debug!("Federated envelope {} from {}: {:?}", message_id, sender_domain, outcome);
            let outcome = match outcome {
                RouteOutcome::Delivered => "delivered",
                RouteOutcome::Queued => "queued",
            };
            Json(FederationAccepted {
                status: "accepted",
                outcome,
            })
            .into_response()
        }
        Err(RelayError::ShuttingDown) => {
            reject(StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down")
        }
        Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /federation/discover`.
pub async fn discover_handler(Extension(hub): Extension<Arc<RelayHub>>) -> impl IntoResponse {
    let config = hub.config();
    Json(json!({
        "name": config.server.name,
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["websocket", "json", "msgpack", "offline_queue"],
        "federation": config.federation.enabled,
        "max_payload_size": config.limits.max_payload_size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(domain: &str, signature: &str) -> FederationEnvelope {
        FederationEnvelope {
            id: "f1".to_string(),
            to: "bob".to_string(),
            from: "carol".to_string(),
            payload: b"sealed".to_vec(),
            sender_domain: domain.to_string(),
            signature: signature.to_string(),
            timestamp: 0,
            ttl: 0,
        }
    }

    #[tokio::test]
    async fn allow_list_checks_domain_and_signature() {
        let verifier = PeerAllowList::from_config(&FederationConfig {
            enabled: true,
            peers: vec!["relay.example.org".to_string()],
        });

        assert!(verifier.verify(&fed("relay.example.org", "sig")).await.is_ok());
        assert_eq!(
            verifier.verify(&fed("evil.example", "sig")).await,
            Err(VerifyError::UnknownPeer("evil.example".to_string()))
        );
        assert_eq!(
            verifier.verify(&fed("relay.example.org", "")).await,
            Err(VerifyError::MissingSignature)
        );
    }
}
