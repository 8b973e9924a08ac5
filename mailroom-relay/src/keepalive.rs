//! Keepalive bookkeeping for one connection.
//!
//! The write pump sends a ping every `ping_interval`; the read pump waits at
//! most until [`KeepaliveTimer::deadline`] for the next inbound frame. A pong
//! moves the deadline forward. Any other inbound frame does not.

use std::time::Duration;
use tokio::time::Instant;

/// Where a connection is in the ping/pong cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    /// No probe outstanding.
    Idle,
    /// A ping was sent and no pong has come back yet.
    AwaitingPong {
        /// When the outstanding ping went out.
        since: Instant,
    },
}

/// Read deadline driven by ping/pong traffic.
#[derive(Debug, Clone)]
pub struct KeepaliveTimer {
    pong_wait: Duration,
    deadline: Instant,
    state: KeepaliveState,
}

impl KeepaliveTimer {
    /// Start a timer at `now`; the first deadline is `now + pong_wait`.
    pub fn new(now: Instant, pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            deadline: now + pong_wait,
            state: KeepaliveState::Idle,
        }
    }

    /// Record that a ping was sent.
    ///
    /// From `Idle` this arms a deadline of `now + pong_wait`. A second ping
    /// while one is already outstanding leaves the deadline alone.
    pub fn probe_sent(&mut self, now: Instant) {
        if self.state == KeepaliveState::Idle {
            self.state = KeepaliveState::AwaitingPong { since: now };
            self.deadline = now + self.pong_wait;
        }
    }

    /// Record that a pong arrived; the deadline moves to `now + pong_wait`.
    pub fn pong_received(&mut self, now: Instant) {
        self.state = KeepaliveState::Idle;
        self.deadline = now + self.pong_wait;
    }

    /// Instant after which the connection is considered dead.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Current state.
    pub fn state(&self) -> KeepaliveState {
        self.state
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Configured pong wait.
    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }
}
