//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The segment ran out of bytes before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Marker byte 255 is reserved and never produced by the writer.
    #[error("reserved compressed-integer marker 0xff")]
    ReservedMarker,

    /// The marker after a multi-byte payload does not repeat the leading marker.
    #[error("compressed-integer marker mismatch: leading {leading}, trailing {trailing}")]
    MarkerMismatch {
        /// Marker read before the payload.
        leading: u8,
        /// Marker read after the payload.
        trailing: u8,
    },

    /// A value was encoded in a longer form than necessary.
    #[error("non-canonical compressed integer {value} under marker {marker}")]
    NonCanonical {
        /// Marker that introduced the payload.
        marker: u8,
        /// Decoded value.
        value: u64,
    },

    /// Unknown value tag.
    #[error("invalid value tag {0:#04x}")]
    InvalidTag(u8),

    /// The tag after a value does not repeat the leading tag.
    #[error("value tag mismatch: leading {leading:#04x}, trailing {trailing:#04x}")]
    TagMismatch {
        /// Tag read before the value.
        leading: u8,
        /// Tag read after the value.
        trailing: u8,
    },

    /// The length after a blob does not repeat the leading length.
    #[error("blob length mismatch: leading {leading}, trailing {trailing}")]
    LengthMismatch {
        /// Length read before the bytes.
        leading: u64,
        /// Length read after the bytes.
        trailing: u64,
    },

    /// Text was not valid UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A declared length exceeds what this platform or the caller allows.
    #[error("length {len} exceeds maximum {max}")]
    LengthOverflow {
        /// Declared length.
        len: u64,
        /// Allowed maximum.
        max: u64,
    },

    /// A patch targeted bytes the chain does not hold.
    #[error("patch at offset {offset} of {len} bytes is outside a chain of {chain_len} bytes")]
    PatchOutOfRange {
        /// Patch offset.
        offset: usize,
        /// Patch length.
        len: usize,
        /// Chain length.
        chain_len: usize,
    },

    /// A complete value was decoded but input bytes were left over.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Operation requires a writer started with a correlated header.
    #[error("writer has no correlated header")]
    NotCorrelated,
}

impl CodecError {
    /// Create a length overflow error.
    pub fn length_overflow(len: u64, max: u64) -> Self {
        Self::LengthOverflow { len, max }
    }

    /// Returns true if more input could have completed the value.
    ///
    /// Streaming readers use this to tell a short buffer from corruption.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof)
    }
}
