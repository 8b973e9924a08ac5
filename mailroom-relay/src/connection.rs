//! Connection handles.
//!
//! A [`ConnectionHandle`] is the hub's view of one live client connection:
//! who it is, where it came from, and a bounded outbound buffer that the
//! session's write pump drains. The hub only ever pushes to the buffer with
//! non-blocking sends.
//!
//! Envelopes and control frames (acks, errors) share the buffer, but control
//! frames may not use the last quarter of it. A client whose acks pile up
//! therefore still has room for envelopes routed to it.

use mailroom_types::{Envelope, Identity, ServerFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receiving side of a connection's outbound buffer.
///
/// Owned by exactly one write pump.
pub type OutboundReceiver = mpsc::Receiver<ServerFrame>;

/// Why a frame could not be pushed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Outbound buffer is at capacity.
    Full,
    /// The connection has been closed.
    Closed,
}

/// An envelope that could not be pushed, handed back so it can be queued.
#[derive(Debug)]
pub struct Undelivered {
    /// Why the push failed.
    pub reason: PushError,
    /// The envelope, unchanged.
    pub envelope: Envelope,
}

/// One logical client connection.
pub struct ConnectionHandle {
    id: u64,
    identity: Identity,
    remote_address: String,
    connected_at: Instant,
    outbound: mpsc::Sender<ServerFrame>,
    control_reserve: usize,
    closed: AtomicBool,
    close_signal: Notify,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote_address", &self.remote_address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Create a handle with an outbound buffer of `capacity` frames.
    ///
    /// Returns the handle and the receiver its write pump will own.
    pub fn new(
        identity: Identity,
        remote_address: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, OutboundReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            remote_address: remote_address.into(),
            connected_at: Instant::now(),
            outbound: tx,
            control_reserve: (capacity / 4).max(1),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        });
        (handle, rx)
    }

    /// Process-unique connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The identity this connection speaks for.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Peer address as reported by the listener.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// When the handle was created.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Push a control frame (ack, error) without waiting.
    ///
    /// Refused with [`PushError::Full`] once only the envelope reserve is
    /// left. The frame is dropped on failure; control frames are best effort.
    pub fn try_send(&self, frame: ServerFrame) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        if self.available() <= self.control_reserve {
            return Err(PushError::Full);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Push an envelope for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns the envelope inside [`Undelivered`] when the buffer is full
    /// or the connection is closed, so the caller can queue it instead.
    pub fn try_deliver(&self, envelope: Envelope) -> Result<(), Undelivered> {
        if self.is_closed() {
            return Err(Undelivered {
                reason: PushError::Closed,
                envelope,
            });
        }
        match self.outbound.try_reserve() {
            Ok(permit) => {
                permit.send(ServerFrame::Deliver(envelope));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(Undelivered {
                reason: PushError::Full,
                envelope,
            }),
            Err(mpsc::error::TrySendError::Closed(())) => Err(Undelivered {
                reason: PushError::Closed,
                envelope,
            }),
        }
    }

    /// Free slots left in the outbound buffer.
    pub fn available(&self) -> usize {
        self.outbound.capacity()
    }

    /// Mark the connection closed and wake its write pump.
    ///
    /// Idempotent. Frames still buffered are discarded by the write pump.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailroom_types::MessageId;
    use std::time::Duration;

    fn frame(n: u32) -> ServerFrame {
        ServerFrame::error("test", format!("frame {n}"), Some(MessageId::from("m")))
    }

    #[test]
    fn handles_get_distinct_ids() {
        let (a, _ra) = ConnectionHandle::new(Identity::new("a").unwrap(), "127.0.0.1:1", 4);
        let (b, _rb) = ConnectionHandle::new(Identity::new("a").unwrap(), "127.0.0.1:2", 4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn try_deliver_hands_back_envelope_when_full() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 1);
        let env = Envelope::new(
            Identity::new("a").unwrap(),
            Identity::new("b").unwrap(),
            b"x".to_vec(),
        );
        handle.try_deliver(env.clone()).unwrap();
        let err = handle.try_deliver(env.clone()).unwrap_err();
        assert_eq!(err.reason, PushError::Full);
        assert_eq!(err.envelope, env);
        assert_eq!(handle.try_send(frame(1)), Err(PushError::Full));
        assert_eq!(handle.available(), 0);
    }

    #[test]
    fn closed_handle_rejects_frames() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 4);
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.try_send(frame(1)), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn closed_future_wakes_on_close() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 4);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::task::yield_now().await;
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .unwrap();
    }

    #[test]
    fn control_frames_leave_room_for_envelopes() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 8);
        // Two of eight slots are held back for envelopes
        for n in 0..6 {
            handle.try_send(frame(n)).unwrap();
        }
        assert_eq!(handle.try_send(frame(6)), Err(PushError::Full));
        assert_eq!(handle.available(), 2);

        let env = Envelope::new(
            Identity::new("a").unwrap(),
            Identity::new("b").unwrap(),
            b"x".to_vec(),
        );
        handle.try_deliver(env.clone()).unwrap();
        handle.try_deliver(env).unwrap();
        assert_eq!(handle.available(), 0);
    }

    #[test]
    fn tiny_buffer_keeps_its_slot_for_envelopes() {
        let (handle, _rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 1);
        assert_eq!(handle.try_send(frame(0)), Err(PushError::Full));
    }

    #[tokio::test]
    async fn receiver_sees_frames_in_order() {
        let (handle, mut rx) = ConnectionHandle::new(Identity::new("a").unwrap(), "peer", 4);
        for n in 0..3 {
            handle.try_send(frame(n)).unwrap();
        }
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), frame(n));
        }
    }
}
