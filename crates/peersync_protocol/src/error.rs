//! Error types for protocol encoding and parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame exceeded the maximum allowed size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A discovery datagram did not match the expected format.
    #[error("malformed discovery payload: {0}")]
    MalformedDiscovery(String),

    /// An enum value could not be parsed from its textual form.
    #[error("unknown {kind} value: {value}")]
    UnknownValue {
        /// The kind of value being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}

impl ProtocolError {
    pub(crate) fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::FrameTooLarge { size: 20, max: 10 };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::unknown("change type", "MERGE");
        assert_eq!(err.to_string(), "unknown change type value: MERGE");
    }
}
