//! Error types for Mailroom wire handling.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value could not be written as MessagePack
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[source] rmp_serde::encode::Error),

    /// A binary frame was not valid MessagePack for the expected type
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[source] rmp_serde::decode::Error),

    /// A required envelope field was absent or empty
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// An identity was empty
    #[error("identity must not be empty")]
    EmptyIdentity,

    /// Unknown wire format name
    #[error("unknown wire format: {0}")]
    UnknownFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_names_the_field() {
        let err = WireError::MissingField("to");
        assert_eq!(err.to_string(), "missing required field: to");
    }

    #[test]
    fn truncated_msgpack_is_a_decode_error() {
        let err = rmp_serde::from_slice::<String>(&[0xa5, b'h'])
            .map_err(WireError::MsgPackDecode)
            .unwrap_err();
        assert!(err.to_string().starts_with("msgpack decode:"));
    }

    #[test]
    fn crosses_threads() {
        fn check<T: Send + Sync + 'static>() {}
        check::<WireError>();
    }
}
