//! Frames sent from the relay to a connected client.

use serde::{Deserialize, Serialize};

use crate::{Envelope, MessageId, WireError, WireFormat};

/// Every frame the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// An envelope addressed to this client
    Deliver(Envelope),
    /// Routing result for an envelope this client sent
    Ack(Ack),
    /// A frame from this client was rejected
    Error(ErrorNotice),
}

/// Routing result reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The envelope being acknowledged
    pub message_id: MessageId,
    /// What the relay did with it
    pub status: AckStatus,
}

/// Relay-side fate of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Pushed to the recipient's live connection
    Delivered,
    /// Held for the recipient until it connects or the TTL runs out
    Queued,
}

/// Rejection notice for a malformed or refused frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable detail
    pub message: String,
    /// The offending envelope's ID, when it could be read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl ServerFrame {
    /// Build an error frame.
    pub fn error(code: &str, message: impl Into<String>, message_id: Option<MessageId>) -> Self {
        Self::Error(ErrorNotice {
            code: code.to_string(),
            message: message.into(),
            message_id,
        })
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to MessagePack bytes (map encoding).
    pub fn to_msgpack(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::MsgPackEncode)
    }

    /// Deserialize in the given wire format.
    pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<Self, WireError> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(WireError::MsgPackDecode)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Identity;

    #[test]
    fn deliver_frame_json_shape() {
        let env = Envelope::new(
            Identity::new("alice").unwrap(),
            Identity::new("bob").unwrap(),
            b"hi".to_vec(),
        );
        let json = ServerFrame::Deliver(env.clone()).to_json().unwrap();
        assert!(json.starts_with("{\"type\":\"deliver\",\"data\":{"));
        let decoded = ServerFrame::decode(WireFormat::Json, json.as_bytes()).unwrap();
        assert_eq!(decoded, ServerFrame::Deliver(env));
    }

    #[test]
    fn deliver_frame_msgpack_keeps_payload_bytes() {
        let env = Envelope::new(
            Identity::new("alice").unwrap(),
            Identity::new("bob").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef],
        );
        let bytes = ServerFrame::Deliver(env.clone()).to_msgpack().unwrap();
        let decoded = ServerFrame::decode(WireFormat::MessagePack, &bytes).unwrap();
        assert_eq!(decoded, ServerFrame::Deliver(env));
    }

    #[test]
    fn ack_status_is_snake_case() {
        let ack = ServerFrame::Ack(Ack {
            message_id: MessageId::from("m1"),
            status: AckStatus::Queued,
        });
        let json = ack.to_json().unwrap();
        assert!(json.contains("\"status\":\"queued\""));
    }

    #[test]
    fn error_frame_omits_missing_message_id() {
        let json = ServerFrame::error("malformed", "bad json", None)
            .to_json()
            .unwrap();
        assert!(json.contains("\"code\":\"malformed\""));
        assert!(!json.contains("message_id"));
    }
}
