//! # mailroom-types
//!
//! Wire format types for the Mailroom store-and-forward relay.
//!
//! This crate provides the types shared by the relay and its clients:
//! - [`Identity`], [`MessageId`] - Opaque addressing types
//! - [`Envelope`] - An encrypted message with routing metadata
//! - [`ServerFrame`] - Frames the relay sends back to clients
//! - [`FederationEnvelope`] - Server-to-server envelope form
//! - [`WireError`] - Error types
//!
//! Envelopes travel as JSON in text frames and as MessagePack in binary
//! frames. The payload is opaque to the relay in both encodings.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod frames;
mod ids;

pub use envelope::{unix_now, Envelope, EnvelopeDraft, FederationEnvelope, WireFormat};
pub use error::WireError;
pub use frames::{Ack, AckStatus, ErrorNotice, ServerFrame};
pub use ids::{Identity, MessageId};
