//! Addressing types for Mailroom.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// An opaque recipient or sender token.
///
/// The relay treats identities as uninterpreted keys. How a client derives
/// one (for example by hashing a public key) is its own concern. An identity
/// is never empty: every constructor rejects the empty string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity from a non-empty token.
    pub fn new(token: impl Into<String>) -> Result<Self, WireError> {
        let token = token.into();
        if token.is_empty() {
            return Err(WireError::EmptyIdentity);
        }
        Ok(Self(token))
    }

    /// Generate a random identity for an anonymous connection.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Identity {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "Identity({short})")
    }
}

/// A message identifier, unique per envelope.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new random (UUID v4) message ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identity_rejected() {
        assert!(matches!(Identity::new(""), Err(WireError::EmptyIdentity)));
        assert!(Identity::try_from(String::new()).is_err());
    }

    #[test]
    fn identity_deserialize_rejects_empty() {
        let ok: Identity = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok.as_str(), "alice");
        assert!(serde_json::from_str::<Identity>("\"\"").is_err());
    }

    #[test]
    fn identity_debug_is_truncated() {
        let id = Identity::new("a-very-long-identity-token-value").unwrap();
        assert_eq!(format!("{id:?}"), "Identity(a-very-long-)");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(Identity::generate(), Identity::generate());
    }
}
