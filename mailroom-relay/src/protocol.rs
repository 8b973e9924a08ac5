//! Inbound envelope handling.
//!
//! Turns a raw client frame into a routable [`Envelope`]: size checks,
//! decoding, required-field validation and sender stamping. Also resolves the
//! wire `ttl` value into the lifetime the pending store enforces.

use crate::config::Config;
use crate::error::{ProtocolError, ProtocolResult};
use mailroom_types::{Envelope, EnvelopeDraft, Identity, MessageId, WireFormat};
use std::time::Duration;

/// `ttl` values at or above this are absolute Unix expiry times.
pub const ABSOLUTE_TTL_THRESHOLD: u64 = 1_000_000_000;

/// Limits and defaults applied to every inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundPolicy {
    /// Maximum raw frame size in bytes.
    pub max_frame_size: usize,
    /// Maximum payload size in bytes.
    pub max_payload_size: usize,
    /// TTL stamped on envelopes that carry none, in seconds.
    pub default_ttl_secs: u64,
    /// Upper bound on any lifetime, in seconds.
    pub max_ttl_secs: u64,
}

impl InboundPolicy {
    /// Build the policy from relay configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_frame_size: config.limits.max_frame_size,
            max_payload_size: config.limits.max_payload_size,
            default_ttl_secs: config.messages.default_ttl_secs,
            max_ttl_secs: config.messages.max_ttl_secs,
        }
    }

    /// Resolve a wire `ttl` into a lifetime.
    ///
    /// - `0` means the default TTL
    /// - values at or above [`ABSOLUTE_TTL_THRESHOLD`] are Unix expiry times;
    ///   the lifetime is what remains until then (zero if already past)
    /// - anything else is a lifetime in seconds
    ///
    /// The result is capped at `max_ttl_secs`.
    pub fn resolve_ttl(&self, ttl: u64, now_unix: u64) -> Duration {
        let secs = match ttl {
            0 => self.default_ttl_secs,
            t if t >= ABSOLUTE_TTL_THRESHOLD => t.saturating_sub(now_unix),
            t => t,
        };
        Duration::from_secs(secs.min(self.max_ttl_secs))
    }

    /// Reject frames over the frame cap before decoding them.
    pub fn check_frame_size(&self, size: usize) -> ProtocolResult<()> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Decode and validate one client frame sent by `sender`.
    pub fn decode(
        &self,
        format: WireFormat,
        bytes: &[u8],
        sender: &Identity,
        now_unix: u64,
    ) -> ProtocolResult<Envelope> {
        self.check_frame_size(bytes.len())?;
        let draft = EnvelopeDraft::decode(format, bytes)?;
        self.validate(draft, sender, now_unix)
    }

    /// Validate a decoded draft and stamp the relay-owned fields.
    ///
    /// `from` must be present but is always replaced with `sender`: a client
    /// can only ever send as itself.
    pub fn validate(
        &self,
        draft: EnvelopeDraft,
        sender: &Identity,
        now_unix: u64,
    ) -> ProtocolResult<Envelope> {
        let to = required(draft.to, "to")?;
        required(draft.from, "from")?;
        let payload = match draft.payload {
            Some(p) if !p.is_empty() => p,
            _ => return Err(ProtocolError::MissingField("payload")),
        };
        if payload.len() > self.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_size,
            });
        }
        let to = Identity::new(to).map_err(|_| ProtocolError::MissingField("to"))?;

        let id = match draft.id {
            Some(id) if !id.is_empty() => MessageId::from(id),
            _ => MessageId::generate(),
        };

        Ok(Envelope {
            id,
            to,
            from: sender.clone(),
            payload,
            timestamp: draft.timestamp.filter(|t| *t > 0).unwrap_or(now_unix),
            ttl: draft
                .ttl
                .filter(|t| *t > 0)
                .unwrap_or(self.default_ttl_secs),
            sequence: draft.sequence,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> ProtocolResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField(field)),
    }
}

/// Best-effort read of the `id` field, for error frames about frames that
/// failed validation.
pub fn peek_message_id(format: WireFormat, bytes: &[u8]) -> Option<MessageId> {
    EnvelopeDraft::decode(format, bytes)
        .ok()?
        .id
        .filter(|id| !id.is_empty())
        .map(MessageId::from)
}
