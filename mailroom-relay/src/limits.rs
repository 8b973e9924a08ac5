//! Rate limiting for mailroom-relay.
//!
//! Protects the relay against connection flooding and envelope spam:
//! - connection attempts are limited per client IP address
//! - envelopes are limited per sending [`Identity`]
//! - a global limiter caps aggregate envelope throughput
//!
//! All limiters are governor rate limiters; the keyed ones are backed by
//! DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use mailroom_types::Identity;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Governor limiter keyed by `K`, state held in a DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// The relay's admission and submission limiters.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimits {
    /// `limits.connections_per_ip`, per minute.
    per_ip: Arc<KeyedLimiter<IpAddr>>,
    /// `limits.messages_per_minute`.
    per_sender: Arc<KeyedLimiter<Identity>>,
    /// `limits.global_requests_per_second`.
    global: Arc<GlobalLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("tracked_ips", &self.per_ip.len())
            .field("tracked_senders", &self.per_sender.len())
            .finish_non_exhaustive()
    }
}

fn quota_value(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Build the limiters from `[limits]`.
    ///
    /// Zero quotas are rejected by [`Config::validate`](crate::config::Config::validate);
    /// if one slips through it is treated as one.
    pub fn new(config: &LimitsConfig) -> Self {
        // 10/minute means one cell every 6 seconds with a burst of 10
        let per_ip = Quota::per_minute(quota_value(config.connections_per_ip));
        let per_sender = Quota::per_minute(quota_value(config.messages_per_minute));
        let global = Quota::per_second(quota_value(config.global_requests_per_second));

        Self {
            per_ip: Arc::new(RateLimiter::keyed(per_ip)),
            per_sender: Arc::new(RateLimiter::keyed(per_sender)),
            global: Arc::new(RateLimiter::direct(global)),
        }
    }

    /// Admit or refuse a WebSocket upgrade from `ip`.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.per_ip
            .check_key(&ip)
            .map_err(|_| RateLimitError::Connections(ip))
    }

    /// Admit or refuse one envelope from `sender`.
    ///
    /// The sender's own quota is charged before the global one.
    pub fn check_message(&self, sender: &Identity) -> Result<(), RateLimitError> {
        self.per_sender
            .check_key(sender)
            .map_err(|_| RateLimitError::Sender(sender.clone()))?;
        self.check_global()
    }

    /// Charge one cell against the relay-wide quota.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global.check().map_err(|_| RateLimitError::Global)
    }

    /// IP addresses with limiter state.
    pub fn tracked_ips(&self) -> usize {
        self.per_ip.len()
    }

    /// Sender identities with limiter state.
    pub fn tracked_senders(&self) -> usize {
        self.per_sender.len()
    }

    /// Forget keys whose cells have fully recharged.
    ///
    /// Idle clients otherwise stay in the maps forever. Called from the
    /// expiry sweeper.
    pub fn shrink(&self) {
        self.per_ip.retain_recent();
        self.per_sender.retain_recent();
    }
}

/// A limiter refused the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many upgrade attempts from one address.
    #[error("too many connection attempts from {0}")]
    Connections(IpAddr),
    /// Too many envelopes from one identity.
    #[error("{0} is sending too fast")]
    Sender(Identity),
    /// The relay as a whole is over its request budget.
    #[error("relay is over its global request budget")]
    Global,
}

impl RateLimitError {
    /// Stable code used in error frames.
    pub fn code(&self) -> &'static str {
        "rate_limited"
    }
}
