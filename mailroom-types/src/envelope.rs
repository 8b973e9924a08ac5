//! Envelope - the unit the relay routes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Identity, MessageId, WireError};

/// Encoding used on a connection.
///
/// JSON travels in WebSocket text frames, MessagePack in binary frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    /// JSON, payload as standard base64.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// MessagePack, payload as raw bytes.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl FromStr for WireFormat {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MessagePack),
            other => Err(WireError::UnknownFormat(other.to_string())),
        }
    }
}

/// An encrypted message with routing metadata.
///
/// The relay reads `to`, `from`, `ttl` and the payload length. It never
/// looks inside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier
    pub id: MessageId,
    /// Recipient
    pub to: Identity,
    /// Sender (stamped by the relay for client-originated envelopes)
    pub from: Identity,
    /// Encrypted payload (opaque to the relay)
    #[serde(with = "payload_codec")]
    pub payload: Vec<u8>,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Lifetime: relative seconds, or an absolute Unix expiry
    pub ttl: u64,
    /// Optional sender-assigned ordering counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl Envelope {
    /// Create an envelope with a fresh ID and the current timestamp.
    ///
    /// `ttl` is left at zero, meaning "use the relay default".
    pub fn new(to: Identity, from: Identity, payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::generate(),
            to,
            from,
            payload,
            timestamp: unix_now(),
            ttl: 0,
            sequence: None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to MessagePack bytes (map encoding).
    pub fn to_msgpack(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::MsgPackEncode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::MsgPackDecode)
    }
}

/// An envelope as submitted by a client, before validation.
///
/// Every field is optional so that the relay can report exactly which
/// required field is missing instead of a generic decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeDraft {
    /// Message ID
    #[serde(default)]
    pub id: Option<String>,
    /// Recipient
    #[serde(default)]
    pub to: Option<String>,
    /// Claimed sender
    #[serde(default)]
    pub from: Option<String>,
    /// Encrypted payload
    #[serde(
        default,
        serialize_with = "payload_codec::serialize_option",
        deserialize_with = "payload_codec::deserialize_option"
    )]
    pub payload: Option<Vec<u8>>,
    /// Unix timestamp (seconds)
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// Lifetime
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Ordering counter
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl EnvelopeDraft {
    /// Decode a draft in the given wire format.
    pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<Self, WireError> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(WireError::MsgPackDecode)
            }
        }
    }
}

impl From<Envelope> for EnvelopeDraft {
    fn from(env: Envelope) -> Self {
        Self {
            id: Some(env.id.to_string()),
            to: Some(env.to.into()),
            from: Some(env.from.into()),
            payload: Some(env.payload),
            timestamp: Some(env.timestamp),
            ttl: Some(env.ttl),
            sequence: env.sequence,
        }
    }
}

/// Server-to-server envelope.
///
/// Carries the sender's relay domain and a signature. Verifying that
/// signature belongs to the federation layer, not to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationEnvelope {
    /// Message ID
    pub id: String,
    /// Recipient on this relay
    pub to: String,
    /// Sender on the originating relay
    pub from: String,
    /// Encrypted payload
    #[serde(with = "payload_codec")]
    pub payload: Vec<u8>,
    /// Domain of the originating relay
    pub sender_domain: String,
    /// Signature over the envelope (opaque here)
    pub signature: String,
    /// Unix timestamp (seconds)
    #[serde(default)]
    pub timestamp: u64,
    /// Lifetime, same encoding as [`Envelope::ttl`]
    #[serde(default)]
    pub ttl: u64,
}

impl FederationEnvelope {
    /// Convert to a routable envelope, checking required fields.
    pub fn into_envelope(self) -> Result<Envelope, WireError> {
        if self.id.is_empty() {
            return Err(WireError::MissingField("id"));
        }
        let to = Identity::new(self.to).map_err(|_| WireError::MissingField("to"))?;
        let from = Identity::new(self.from).map_err(|_| WireError::MissingField("from"))?;
        if self.payload.is_empty() {
            return Err(WireError::MissingField("payload"));
        }
        let timestamp = if self.timestamp == 0 {
            unix_now()
        } else {
            self.timestamp
        };
        Ok(Envelope {
            id: MessageId::from(self.id),
            to,
            from,
            payload: self.payload,
            timestamp,
            ttl: self.ttl,
            sequence: None,
        })
    }
}

/// Current Unix time in seconds; zero if the clock is before the epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Payload encoding: base64 string for human-readable formats, raw bytes
/// otherwise.
mod payload_codec {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::de::{self, Deserializer, SeqAccess, Visitor};
    use serde::{Deserialize, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            STANDARD.decode(text.as_bytes()).map_err(de::Error::custom)
        } else {
            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }

    pub fn serialize_option<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serialize(b, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<Payload>::deserialize(deserializer)?.map(|p| p.0))
    }

    struct Payload(Vec<u8>);

    impl<'de> Deserialize<'de> for Payload {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserialize(deserializer).map(Payload)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}
