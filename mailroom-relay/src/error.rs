//! Error types for mailroom-relay.

use mailroom_types::WireError;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The hub has been shut down and accepts no more work.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] crate::limits::RateLimitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection protocol errors.
///
/// Malformed frames are connection-local and non-fatal; transport and
/// keepalive failures end the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    /// A required envelope field was absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Payload larger than the configured cap.
    #[error("payload too large: {size} bytes (limit: {limit} bytes)")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Whole frame larger than the configured cap.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Transport error (read or write).
    #[error("transport error: {0}")]
    Transport(String),

    /// No pong arrived before the read deadline.
    #[error("keepalive timeout: no pong within {0:?}")]
    KeepaliveTimeout(std::time::Duration),
}

impl ProtocolError {
    /// Stable code used in error frames sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Wire(_) => "malformed",
            Self::MissingField(_) => "missing_field",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Transport(_) => "transport",
            Self::KeepaliveTimeout(_) => "keepalive_timeout",
        }
    }

    /// Whether the connection can keep going after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::KeepaliveTimeout(_))
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_frames_are_not_fatal() {
        assert!(!ProtocolError::MissingField("to").is_fatal());
        assert!(!ProtocolError::PayloadTooLarge { size: 2, limit: 1 }.is_fatal());
        assert!(ProtocolError::Transport("reset".into()).is_fatal());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProtocolError::MissingField("from").code(), "missing_field");
        assert_eq!(
            ProtocolError::Wire(WireError::MissingField("to")).code(),
            "malformed"
        );
    }

    #[test]
    fn display_includes_limits() {
        let err = ProtocolError::PayloadTooLarge {
            size: 300,
            limit: 256,
        };
        assert_eq!(
            err.to_string(),
            "payload too large: 300 bytes (limit: 256 bytes)"
        );
    }
}
