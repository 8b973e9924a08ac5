//! The relay hub.
//!
//! `RelayHub` owns the registry of live connections and the pending store,
//! both behind one mutex. Every operation holds the lock for a short,
//! non-awaiting critical section: pushes to connection buffers are
//! non-blocking, so the lock is never held across I/O.

use crate::config::Config;
use crate::connection::{ConnectionHandle, PushError, Undelivered};
use crate::error::{RelayError, Result};
use crate::limits::RateLimits;
use crate::pending::{PendingStore, QueuedEnvelope};
use crate::protocol::InboundPolicy;
use mailroom_types::{unix_now, Envelope, Identity};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Connections registered.
    pub connections_total: AtomicU64,
    /// Envelopes accepted for routing (client and federation).
    pub messages_received: AtomicU64,
    /// Envelopes pushed to a live connection, directly or from the queue.
    pub messages_delivered: AtomicU64,
    /// Envelopes placed in the pending store.
    pub messages_queued: AtomicU64,
    /// Queued envelopes dropped because their TTL ran out.
    pub messages_expired: AtomicU64,
    /// Queued envelopes dropped for any other reason (queue cap, shutdown).
    pub messages_dropped: AtomicU64,
    /// Envelopes received over federation.
    pub federated_received: AtomicU64,
    /// Client frames rejected as malformed.
    pub malformed_frames: AtomicU64,
    /// Connections closed because the same identity connected again.
    pub displacements: AtomicU64,
    /// Rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Time from acceptance to push onto a connection buffer.
    pub delivery_latency: LatencyHistogram,
}

impl RelayMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Upper bounds (seconds) of the delivery latency buckets.
pub const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 60.0, 600.0, 3600.0, 86400.0,
];

/// Fixed-bucket latency histogram with atomic counters.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    /// Record one observation.
    pub fn observe(&self, latency: Duration) {
        let secs = latency.as_secs_f64();
        if let Some(idx) = LATENCY_BUCKETS.iter().position(|le| secs <= *le) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Cumulative counts per bucket, paired with the bucket bound.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        LATENCY_BUCKETS
            .iter()
            .zip(self.buckets.iter())
            .map(|(le, n)| {
                running += n.load(Ordering::Relaxed);
                (*le, running)
            })
            .collect()
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observations in seconds.
    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Where [`RelayHub::route`] put an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to the recipient's outbound buffer.
    Delivered,
    /// Held in the pending store.
    Queued,
}

struct HubState {
    connections: HashMap<Identity, Arc<ConnectionHandle>>,
    pending: PendingStore,
    accepting: bool,
}

/// Main relay hub.
pub struct RelayHub {
    config: Config,
    policy: InboundPolicy,
    /// Rate limiters for connections and envelopes.
    rate_limits: RateLimits,
    /// Operational metrics (counters, histogram).
    metrics: RelayMetrics,
    state: Mutex<HubState>,
    started_at: Instant,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("connections", &self.connection_count())
            .field("queued", &self.queued_count())
            .finish_non_exhaustive()
    }
}

impl RelayHub {
    /// Create a hub with the given config.
    pub fn new(config: Config) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let policy = InboundPolicy::from_config(&config);
        let pending = PendingStore::with_recipient_limit(config.messages.max_queue_per_recipient);
        Self {
            config,
            policy,
            rate_limits,
            metrics: RelayMetrics::default(),
            state: Mutex::new(HubState {
                connections: HashMap::new(),
                pending,
                accepting: true,
            }),
            started_at: Instant::now(),
        }
    }

    /// Get the hub configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Limits and defaults for inbound envelopes.
    pub fn policy(&self) -> &InboundPolicy {
        &self.policy
    }

    /// Get the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Time since the hub was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    // Lock poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` as the live connection for its identity.
    ///
    /// An existing connection for the same identity is closed first. Anything
    /// queued for the identity is then pushed to the new handle in order;
    /// whatever does not fit goes back to the front of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ShuttingDown`] (and closes `handle`) once
    /// [`shutdown`](Self::shutdown) has run.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        let now = Instant::now();
        let identity = handle.identity().clone();
        let mut state = self.lock();
        if !state.accepting {
            drop(state);
            handle.close();
            return Err(RelayError::ShuttingDown);
        }

        if let Some(previous) = state.connections.insert(identity.clone(), handle.clone()) {
            previous.close();
            RelayMetrics::incr(&self.metrics.displacements);
            tracing::info!(
                "Displaced connection {} for {} after {:?} (new connection {} from {})",
                previous.id(),
                identity,
                now.saturating_duration_since(previous.connected_at()),
                handle.id(),
                handle.remote_address()
            );
        }
        RelayMetrics::incr(&self.metrics.connections_total);

        let queued = state.pending.drain(&identity);
        if queued.is_empty() {
            tracing::debug!("Registered {} (connection {})", identity, handle.id());
            return Ok(());
        }

        let (delivered, expired, remaining) = self.flush_queue(&handle, queued, now);
        let left = remaining.len();
        state.pending.requeue_front(&identity, remaining);
        drop(state);

        RelayMetrics::add(&self.metrics.messages_expired, expired);
        tracing::info!(
            "Registered {} (connection {}): {} queued delivered, {} expired, {} still queued",
            identity,
            handle.id(),
            delivered,
            expired,
            left
        );
        Ok(())
    }

    /// Push queued envelopes to `handle` until the buffer fills.
    ///
    /// Returns (delivered, expired, not yet delivered).
    fn flush_queue(
        &self,
        handle: &ConnectionHandle,
        mut queued: VecDeque<QueuedEnvelope>,
        now: Instant,
    ) -> (usize, usize, VecDeque<QueuedEnvelope>) {
        let mut delivered = 0;
        let mut expired = 0;
        while let Some(entry) = queued.pop_front() {
            if entry.is_expired(now) {
                expired += 1;
                continue;
            }
            let QueuedEnvelope {
                envelope,
                received_at,
                ttl,
            } = entry;
            match handle.try_deliver(envelope) {
                Ok(()) => {
                    delivered += 1;
                    RelayMetrics::incr(&self.metrics.messages_delivered);
                    self.metrics
                        .delivery_latency
                        .observe(now.saturating_duration_since(received_at));
                }
                Err(Undelivered { envelope, .. }) => {
                    queued.push_front(QueuedEnvelope {
                        envelope,
                        received_at,
                        ttl,
                    });
                    break;
                }
            }
        }
        (delivered, expired, queued)
    }

    /// Remove `handle` from the registry if it is still the live connection
    /// for its identity, then close it.
    ///
    /// Returns whether the registry entry was removed. A handle that was
    /// already displaced leaves the newer connection alone.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let identity = handle.identity();
        let removed = {
            let mut state = self.lock();
            match state.connections.get(identity) {
                Some(current) if current.id() == handle.id() => {
                    state.connections.remove(identity);
                    true
                }
                _ => false,
            }
        };
        handle.close();
        if removed {
            tracing::debug!("Unregistered {} (connection {})", identity, handle.id());
        } else {
            tracing::debug!(
                "Stale unregister for {} (connection {}) ignored",
                identity,
                handle.id()
            );
        }
        removed
    }

    /// Route an envelope to its recipient.
    ///
    /// Pushes to the recipient's live connection when there is one with
    /// room; otherwise queues the envelope. Never blocks and never drops.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ShuttingDown`] once [`shutdown`](Self::shutdown)
    /// has run; nothing is delivered or queued in that case.
    pub fn route(&self, envelope: Envelope) -> Result<RouteOutcome> {
        let now = Instant::now();
        let ttl = self.policy.resolve_ttl(envelope.ttl, unix_now());
        let mut state = self.lock();
        if !state.accepting {
            return Err(RelayError::ShuttingDown);
        }
        RelayMetrics::incr(&self.metrics.messages_received);

        let envelope = match state.connections.get(&envelope.to) {
            Some(handle) => match handle.try_deliver(envelope) {
                Ok(()) => {
                    drop(state);
                    RelayMetrics::incr(&self.metrics.messages_delivered);
                    self.metrics.delivery_latency.observe(now.elapsed());
                    return Ok(RouteOutcome::Delivered);
                }
                Err(Undelivered { reason, envelope }) => {
                    match reason {
                        PushError::Full => tracing::warn!(
                            "Outbound buffer full for {}, queuing {}",
                            envelope.to,
                            envelope.id
                        ),
                        PushError::Closed => tracing::debug!(
                            "Connection for {} is closing, queuing {}",
                            envelope.to,
                            envelope.id
                        ),
                    }
                    envelope
                }
            },
            None => envelope,
        };

        let recipient = envelope.to.clone();
        let result = state.pending.enqueue(envelope, now, ttl);
        drop(state);

        RelayMetrics::incr(&self.metrics.messages_queued);
        if let Some(evicted) = result.evicted {
            RelayMetrics::incr(&self.metrics.messages_dropped);
            tracing::warn!(
                "Queue for {} at capacity, dropped oldest envelope {}",
                recipient,
                evicted.envelope.id
            );
        }
        tracing::debug!("Queued for {} (depth {})", recipient, result.depth);
        Ok(RouteOutcome::Queued)
    }

    /// Route an envelope that arrived from a peer relay.
    ///
    /// Same semantics as [`route`](Self::route), counted separately.
    pub fn relay_federated(&self, envelope: Envelope) -> Result<RouteOutcome> {
        let outcome = self.route(envelope)?;
        RelayMetrics::incr(&self.metrics.federated_received);
        Ok(outcome)
    }

    /// Drop every queued envelope whose TTL has elapsed at `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let removed = self.lock().pending.sweep_expired(now);
        RelayMetrics::add(&self.metrics.messages_expired, removed);
        removed
    }

    /// Stop accepting work, close every connection and drop the queue.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let (handles, dropped) = {
            let mut state = self.lock();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            let handles: Vec<_> = state.connections.drain().map(|(_, h)| h).collect();
            (handles, state.pending.clear())
        };
        for handle in &handles {
            handle.close();
        }
        RelayMetrics::add(&self.metrics.messages_dropped, dropped);
        tracing::info!(
            "Hub shut down: closed {} connections, dropped {} queued envelopes",
            handles.len(),
            dropped
        );
    }

    /// Record a client frame rejected as malformed.
    pub fn record_malformed(&self) {
        RelayMetrics::incr(&self.metrics.malformed_frames);
    }

    /// Record a rate limit rejection.
    pub fn record_rate_limited(&self) {
        RelayMetrics::incr(&self.metrics.rate_limit_hits);
    }

    /// Whether the hub still accepts connections and envelopes.
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Total queued envelopes.
    pub fn queued_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Recipients with at least one queued envelope.
    pub fn queued_recipients(&self) -> usize {
        self.lock().pending.recipients()
    }

    /// Queued envelopes for one recipient.
    pub fn queued_for(&self, identity: &Identity) -> usize {
        self.lock().pending.len_for(identity)
    }

    /// Whether `identity` has a registered connection.
    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.lock().connections.contains_key(identity)
    }
}
