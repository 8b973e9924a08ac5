//! Server assembly.
//!
//! Wires the hub, the expiry sweeper and the HTTP router together and runs
//! them until a shutdown future resolves.

use crate::cleanup::spawn_sweeper;
use crate::config::Config;
use crate::error::Result;
use crate::http::build_router;
use crate::hub::RelayHub;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serve on `listener` until `shutdown` resolves.
///
/// On shutdown the sweeper stops, every connection is closed and the
/// pending queue is dropped.
///
/// # Errors
///
/// Returns [`RelayError::Config`](crate::error::RelayError::Config) if the
/// configuration is invalid and [`RelayError::Io`](crate::error::RelayError::Io)
/// if the listener fails.
pub async fn run<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let cleanup = config.cleanup.clone();
    let hub = Arc::new(RelayHub::new(config));
    serve(hub, listener, cleanup, shutdown).await
}

/// Serve an existing hub on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    hub: Arc<RelayHub>,
    listener: TcpListener,
    cleanup: crate::config::CleanupConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(hub.clone(), cleanup, shutdown_rx);

    tracing::info!(
        "mailroom-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    let app = build_router(hub.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let signal_hub = hub.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down");
            let _ = shutdown_tx.send(true);
            signal_hub.shutdown();
        })
        .await;

    // Also covers a listener failure that bypassed the shutdown future
    hub.shutdown();
    if let Err(e) = sweeper.await {
        tracing::warn!("Expiry sweeper ended abnormally: {}", e);
    }
    tracing::info!("mailroom-relay stopped");
    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.keepalive.ping_interval_secs = 120;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let err = run(config, listener, std::future::ready(())).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn shutdown_future_stops_server_and_hub() {
        let hub = Arc::new(RelayHub::new(Config::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(serve(
            hub.clone(),
            listener,
            Config::default().cleanup,
            async move {
                let _ = rx.await;
            },
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.is_accepting());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
        assert!(!hub.is_accepting());
    }
}
