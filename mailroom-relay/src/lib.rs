//! # mailroom-relay
//!
//! Store-and-forward relay for opaque encrypted envelopes.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections, one per client identity
//! - Routes each envelope to its recipient's live connection
//! - Holds envelopes for offline recipients until they connect or expire
//! - Never sees plaintext (payloads are forwarded untouched)
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐  /ws  (JSON or MessagePack frames)  ┌── Client B
//!            │                                     │
//!        ┌───┴─────────────────────────────────────┴───┐
//!        │                 mailroom-relay              │
//!        │  Session (read pump) ──► RelayHub::route    │
//!        │                            │         │      │
//!        │            ConnectionHandle      PendingStore
//!        │                 │                    ▲      │
//!        │  Session (write pump)         ExpirySweeper │
//!        └─────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery contract
//!
//! Routing never blocks and never drops a validated envelope: it is either
//! pushed to the recipient's outbound buffer or queued. Queued envelopes are
//! drained to the recipient, in order, when it registers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod hub;
pub mod keepalive;
pub mod limits;
pub mod pending;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;
