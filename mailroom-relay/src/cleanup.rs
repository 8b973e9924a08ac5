//! Background sweep of expired queued envelopes.
//!
//! Runs on a fixed interval until the shutdown signal fires. Each tick also
//! lets the rate limiters forget idle clients.

use crate::config::CleanupConfig;
use crate::hub::RelayHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Spawn the expiry sweeper.
///
/// Returns immediately (with an already finished task) when the sweeper is
/// disabled. Otherwise runs until `shutdown` turns `true` or its sender is
/// dropped.
pub fn spawn_sweeper(
    hub: Arc<RelayHub>,
    config: CleanupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Expiry sweeper disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Expiry sweeper started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let expired = hub.sweep_expired(Instant::now());
                    if expired > 0 {
                        tracing::info!(
                            "Sweep: dropped {} expired envelopes ({} still queued)",
                            expired,
                            hub.queued_count()
                        );
                    } else {
                        tracing::debug!("Sweep: nothing expired");
                    }
                    hub.rate_limits().shrink();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Expiry sweeper stopped");
    })
}
