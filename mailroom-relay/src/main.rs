//! mailroom-relay binary entry point.
//!
//! Usage:
//! ```bash
//! mailroom-relay --config relay.toml
//! mailroom-relay --config relay.toml --check-config
//! mailroom-relay --bind 127.0.0.1:9000
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use mailroom_relay::config::Config;
use mailroom_relay::{server, telemetry};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "relay.toml";

/// Store-and-forward relay for opaque encrypted envelopes.
#[derive(Parser, Debug)]
#[command(name = "mailroom-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: relay.toml if present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override `server.bind_address`
    #[arg(long)]
    bind: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                Config::from_file(&path)?
            } else {
                Config::default()
            }
        }
    };
    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).context("Invalid configuration")?;

    if cli.check_config {
        println!("configuration OK");
        return Ok(());
    }

    telemetry::init(&config.logging).context("Failed to initialize logging")?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;

    server::run(config, listener, shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
