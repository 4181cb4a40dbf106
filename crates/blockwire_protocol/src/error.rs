//! Error types for the wire protocol.

use blockwire_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or framing a connection's byte stream.
///
/// Every receive-side error is a desync: the stream position can no longer
/// be trusted and the caller must kill the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Decoding a primitive failed structurally.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The stream named an opcode nothing is registered for.
    #[error("unregistered opcode {0}")]
    UnknownOpcode(u8),

    /// Opcode 0 is reserved and can never be registered.
    #[error("opcode {0} is reserved")]
    ReservedOpcode(u8),

    /// An opcode was registered twice.
    #[error("opcode {code} is already registered as {existing}")]
    DuplicateOpcode {
        /// Code being registered.
        code: u8,
        /// Name of the existing registration.
        existing: &'static str,
    },

    /// A message step function was called with a phase it does not know.
    #[error("{message} has no phase {phase}")]
    InvalidPhase {
        /// Message type name.
        message: &'static str,
        /// Phase requested.
        phase: u16,
    },

    /// A step received a different input than the frame it asked for.
    #[error("phase {phase} expected {expected} input")]
    UnexpectedInput {
        /// Phase being resumed.
        phase: u16,
        /// Input kind the phase reads.
        expected: &'static str,
    },

    /// A blob announced more bytes than the receive limits allow.
    #[error("blob of {len} bytes exceeds limit {max}")]
    BlobTooLarge {
        /// Announced length.
        len: u64,
        /// Configured limit.
        max: usize,
    },

    /// A message asked to buffer more bytes than the receive limits allow.
    #[error("message awaits {bytes} bytes, limit is {max}")]
    AwaitTooLarge {
        /// Bytes requested.
        bytes: usize,
        /// Configured limit.
        max: usize,
    },

    /// Text primitive was not valid UTF-8.
    #[error("invalid UTF-8 text")]
    InvalidUtf8,

    /// Primitive frames nested deeper than the fixed frame stack.
    #[error("receive frame stack overflow (capacity {capacity})")]
    FrameOverflow {
        /// Stack capacity.
        capacity: usize,
    },

    /// Handshake headers grew past the configured limit.
    #[error("handshake exceeds {limit} bytes")]
    HandshakeTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// A handshake header line has no colon.
    #[error("malformed handshake header line")]
    MalformedHeader,

    /// The handshake ended without a `Sec-WebSocket-Key` header.
    #[error("handshake has no Sec-WebSocket-Key")]
    MissingKey,

    /// A websocket frame violated the subset of RFC 6455 we accept.
    #[error("websocket frame error: {message}")]
    WebSocket {
        /// What was wrong with the frame.
        message: String,
    },

    /// A correlated request was queued with an uncorrelated writer.
    #[error("requests must be started with a correlated header")]
    NotCorrelated,
}

impl ProtocolError {
    /// Create a websocket frame error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create an invalid phase error.
    pub fn invalid_phase(message: &'static str, phase: u16) -> Self {
        Self::InvalidPhase { message, phase }
    }

    /// Returns true if the error happened before websocket framing began.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTooLarge { .. } | Self::MalformedHeader | Self::MissingKey
        )
    }

    /// Returns true for registration mistakes rather than stream errors.
    #[must_use]
    pub fn is_registration(&self) -> bool {
        matches!(self, Self::ReservedOpcode(_) | Self::DuplicateOpcode { .. })
    }
}

/// Failure delivered to a response callback instead of a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The connection collapsed while the request was queued or in flight.
    #[error("connection collapsed: {reason}")]
    Collapsed {
        /// Why the connection went away.
        reason: String,
    },

    /// The request was never sent because the queue was already closed.
    #[error("connection closed before the request was sent")]
    Closed,
}

impl RequestError {
    /// Create a collapsed error.
    pub fn collapsed(reason: impl Into<String>) -> Self {
        Self::Collapsed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ProtocolError::MissingKey.is_handshake());
        assert!(!ProtocolError::UnknownOpcode(9).is_handshake());
        assert!(ProtocolError::ReservedOpcode(0).is_registration());
        assert!(!ProtocolError::InvalidUtf8.is_registration());
    }

    #[test]
    fn display_names_the_detail() {
        let err = ProtocolError::invalid_phase("Payload", 7);
        assert_eq!(err.to_string(), "Payload has no phase 7");
        let err = RequestError::collapsed("peer reset");
        assert_eq!(err.to_string(), "connection collapsed: peer reset");
    }
}
