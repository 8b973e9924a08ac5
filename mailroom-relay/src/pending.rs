//! Per-recipient pending envelopes.
//!
//! Envelopes for recipients that are offline (or whose outbound buffer is
//! full) wait here in arrival order until the recipient registers or their
//! TTL runs out. The store has no locking of its own: the hub owns it and
//! serializes every access.

use mailroom_types::{Envelope, Identity};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// An envelope waiting for its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEnvelope {
    /// The envelope, untouched.
    pub envelope: Envelope,
    /// When the relay queued it.
    pub received_at: Instant,
    /// How long it may wait.
    pub ttl: Duration,
}

impl QueuedEnvelope {
    /// Expired when `now - received_at >= ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.received_at) >= self.ttl
    }
}

/// What [`PendingStore::enqueue`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Queue depth for the recipient after the insert.
    pub depth: usize,
    /// Oldest envelope evicted to respect the per-recipient cap, if any.
    pub evicted: Option<QueuedEnvelope>,
}

/// FIFO queues keyed by recipient.
#[derive(Debug, Default)]
pub struct PendingStore {
    queues: HashMap<Identity, VecDeque<QueuedEnvelope>>,
    total: usize,
    max_per_recipient: usize,
}

impl PendingStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that keeps at most `max` envelopes per recipient.
    ///
    /// Zero means unlimited.
    pub fn with_recipient_limit(max: usize) -> Self {
        Self {
            max_per_recipient: max,
            ..Self::default()
        }
    }

    /// Append an envelope to its recipient's queue.
    pub fn enqueue(&mut self, envelope: Envelope, now: Instant, ttl: Duration) -> Enqueued {
        let queue = self.queues.entry(envelope.to.clone()).or_default();
        let evicted = if self.max_per_recipient > 0 && queue.len() >= self.max_per_recipient {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(QueuedEnvelope {
            envelope,
            received_at: now,
            ttl,
        });
        let depth = queue.len();
        if evicted.is_none() {
            self.total += 1;
        }
        Enqueued { depth, evicted }
    }

    /// Remove and return everything queued for `identity`, oldest first.
    pub fn drain(&mut self, identity: &Identity) -> VecDeque<QueuedEnvelope> {
        let drained = self.queues.remove(identity).unwrap_or_default();
        self.total -= drained.len();
        drained
    }

    /// Put undelivered envelopes back ahead of anything queued since.
    pub fn requeue_front(&mut self, identity: &Identity, mut remaining: VecDeque<QueuedEnvelope>) {
        if remaining.is_empty() {
            return;
        }
        self.total += remaining.len();
        let queue = self.queues.entry(identity.clone()).or_default();
        remaining.append(queue);
        *queue = remaining;
    }

    /// Drop every envelope whose TTL has elapsed at `now`.
    ///
    /// Returns the number removed. Recipients left with nothing are removed
    /// entirely.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|q| !q.is_expired(now));
            removed += before - queue.len();
            !queue.is_empty()
        });
        self.total -= removed;
        removed
    }

    /// Total queued envelopes across all recipients.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Queued envelopes for one recipient.
    pub fn len_for(&self, identity: &Identity) -> usize {
        self.queues.get(identity).map_or(0, VecDeque::len)
    }

    /// Number of recipients with something queued.
    pub fn recipients(&self) -> usize {
        self.queues.len()
    }

    /// Drop everything. Returns how many envelopes were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.total;
        self.queues.clear();
        self.total = 0;
        dropped
    }
}
