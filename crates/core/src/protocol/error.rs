use super::messages::MessageType;
use onionmesh_common::OnionError;

/// Wire-level violations. Every one of these is fatal to the connection it
/// arrived on; the codec never resynchronizes inside a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Frame has wrong length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Encoded message of {len} bytes exceeds frame capacity {max}")]
    Oversized { len: usize, max: usize },

    #[error("Field {field} of {len} bytes exceeds maximum {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Unknown message type 0x{0:04x}")]
    UnknownMessageType(u16),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Datum checksum mismatch")]
    ChecksumMismatch,

    #[error("Relay envelope digest mismatch")]
    DigestMismatch,

    #[error("{0:?} cannot travel inside a relay envelope")]
    NotRelayable(MessageType),
}

impl From<ProtocolError> for OnionError {
    fn from(err: ProtocolError) -> Self {
        OnionError::protocol_caused_by("malformed tunnel message", err)
    }
}
