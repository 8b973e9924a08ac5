//! WebSocket upgrade endpoint.

use crate::hub::RelayHub;
use crate::session::Session;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension,
};
use mailroom_types::{Identity, WireFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Query parameters accepted on `/ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    /// Identity to register as; a random one is generated when absent.
    pub id: Option<String>,
    /// `json` (default) or `msgpack`.
    pub format: Option<String>,
}

/// Why a connection was refused before the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// The hub has shut down.
    ShuttingDown,
    /// Too many attempts from this address.
    RateLimited,
    /// `limits.max_connections` reached.
    AtCapacity,
    /// Unknown `format` value.
    BadFormat(String),
}

impl IntoResponse for Refusal {
    fn into_response(self) -> Response {
        match self {
            Self::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response()
            }
            Self::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, "connection rate limit exceeded").into_response()
            }
            Self::AtCapacity => {
                (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response()
            }
            Self::BadFormat(format) => (
                StatusCode::BAD_REQUEST,
                format!("unknown wire format: {format}"),
            )
                .into_response(),
        }
    }
}

/// Decide whether a connection may proceed, and as whom.
pub fn admit(
    hub: &RelayHub,
    params: &ConnectParams,
    remote: Option<SocketAddr>,
) -> Result<(Identity, WireFormat), Refusal> {
    if !hub.is_accepting() {
        return Err(Refusal::ShuttingDown);
    }
    if let Some(addr) = remote {
        if let Err(e) = hub.rate_limits().check_connection(addr.ip()) {
            tracing::warn!("Connection from {} refused: {}", addr, e);
            hub.record_rate_limited();
            return Err(Refusal::RateLimited);
        }
    }
    let max = hub.config().limits.max_connections;
    if hub.connection_count() >= max {
        tracing::warn!("Connection limit ({}) reached", max);
        return Err(Refusal::AtCapacity);
    }

    let format = match params.format.as_deref() {
        None | Some("") => WireFormat::default(),
        Some(raw) => raw
            .parse::<WireFormat>()
            .map_err(|_| Refusal::BadFormat(raw.to_string()))?,
    };

    let identity = match params.id.as_deref().map(Identity::new) {
        Some(Ok(identity)) => identity,
        _ => {
            let identity = Identity::generate();
            tracing::info!("No identity supplied, assigned {}", identity);
            identity
        }
    };
    Ok((identity, format))
}

/// `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(hub): Extension<Arc<RelayHub>>,
) -> Response {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    let (identity, format) = match admit(&hub, &params, remote) {
        Ok(admitted) => admitted,
        Err(refusal) => return refusal.into_response(),
    };

    let remote_address = remote.map_or_else(|| "unknown".to_string(), |a| a.to_string());
    let max_size = hub.config().limits.max_frame_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| async move {
            let (session, outbound) = Session::new(hub, identity, remote_address, format);
            session.run(outbound, socket).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionHandle;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    #[test]
    fn admits_with_requested_identity_and_format() {
        let hub = RelayHub::new(Config::default());
        let params = ConnectParams {
            id: Some("alice".to_string()),
            format: Some("msgpack".to_string()),
        };
        let (identity, format) = admit(&hub, &params, Some(addr(1))).unwrap();
        assert_eq!(identity.as_str(), "alice");
        assert_eq!(format, WireFormat::MessagePack);
    }

    #[test]
    fn missing_identity_is_generated() {
        let hub = RelayHub::new(Config::default());
        let (a, format) = admit(&hub, &ConnectParams::default(), None).unwrap();
        let (b, _) = admit(
            &hub,
            &ConnectParams {
                id: Some(String::new()),
                format: None,
            },
            None,
        )
        .unwrap();
        assert_ne!(a, b);
        assert_eq!(format, WireFormat::Json);
    }

    #[test]
    fn rejects_unknown_format() {
        let hub = RelayHub::new(Config::default());
        let params = ConnectParams {
            id: None,
            format: Some("xml".to_string()),
        };
        assert_eq!(
            admit(&hub, &params, None),
            Err(Refusal::BadFormat("xml".to_string()))
        );
    }

    #[test]
    fn per_ip_rate_limit() {
        let mut config = Config::default();
        config.limits.connections_per_ip = 2;
        let hub = RelayHub::new(config);
        let params = ConnectParams::default();

        assert!(admit(&hub, &params, Some(addr(1))).is_ok());
        assert!(admit(&hub, &params, Some(addr(2))).is_ok());
        assert_eq!(
            admit(&hub, &params, Some(addr(3))),
            Err(Refusal::RateLimited)
        );
        assert_eq!(
            Refusal::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn connection_cap_and_shutdown() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let hub = RelayHub::new(config);
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 4);
        hub.register(handle).unwrap();

        let params = ConnectParams::default();
        assert_eq!(admit(&hub, &params, None), Err(Refusal::AtCapacity));

        hub.shutdown();
        assert_eq!(admit(&hub, &params, None), Err(Refusal::ShuttingDown));
        assert_eq!(
            Refusal::ShuttingDown.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
