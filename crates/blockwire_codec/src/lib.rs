//! # blockwire codec
//!
//! Buffer ownership and byte encoding shared by the blockwire wire protocol
//! and the transaction log.
//!
//! - [`BufferPool`] leases fixed-size [`Block`]s from a lock-protected free
//!   list; a block returns to its pool when dropped.
//! - [`Chain`] strings blocks together into one logical message or record.
//! - [`Writer`] appends encoded data to a chain and patches correlated
//!   headers.
//! - [`Segment`] reads a chain from the front or from the back.
//!
//! ## Encoding
//!
//! Integers use an invertible compressed form (see [`varint`]) whose last
//! byte tells a backward reader how far to step. Field [`Value`]s are
//! bracketed by the same tag at both ends. Together these let the log walk a
//! record from its end without an index.
//!
//! ```
//! use blockwire_codec::{BufferPool, Value, Writer};
//!
//! let mut writer = Writer::with_pool(BufferPool::new(16));
//! writer.write_value(&Value::Integer(-7));
//! writer.write_value(&Value::Text("blockwire".into()));
//!
//! let mut seg = writer.segment();
//! assert_eq!(seg.read_value_back().unwrap(), Value::Text("blockwire".into()));
//! assert_eq!(seg.read_value().unwrap(), Value::Integer(-7));
//! assert!(seg.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod chain;
mod error;
mod pool;
mod segment;
mod value;
pub mod varint;
mod writer;

pub use chain::Chain;
pub use error::{CodecError, CodecResult};
pub use pool::{Block, BufferPool, PoolStats, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use segment::Segment;
pub use value::{tag, Value, ValueKind};
pub use writer::{Writer, CORRELATED_HEADER_LEN, LENGTH_OFFSET, REQUEST_ID_OFFSET};

/// Types that can write themselves to a [`Writer`].
pub trait Encode {
    /// Appends the encoded form.
    fn encode(&self, writer: &mut Writer);
}

/// Types that can read themselves from a [`Segment`].
pub trait Decode: Sized {
    /// Reads one encoded value from the front.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the input is incomplete or malformed.
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self>;
}

/// Encodes `value` into a fresh byte vector.
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    value.encode(&mut writer);
    writer.to_vec()
}

/// Decodes exactly one value from `bytes`.
///
/// # Errors
///
/// Returns [`CodecError::TrailingBytes`] if input is left over after the value.
pub fn from_bytes<T: Decode>(bytes: &[u8]) -> CodecResult<T> {
    let chain = Chain::from_slice(BufferPool::default(), bytes);
    let mut segment = chain.segment();
    let value = T::decode(&mut segment)?;
    match segment.remaining() {
        0 => Ok(value),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

impl Encode for Value {
    fn encode(&self, writer: &mut Writer) {
        writer.write_value(self);
    }
}

impl Decode for Value {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        segment.read_value()
    }
}

impl Encode for u64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_compressed(*self);
    }
}

impl Decode for u64 {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        segment.read_compressed()
    }
}

impl Encode for i64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_signed(*self);
    }
}

impl Decode for i64 {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        segment.read_signed()
    }
}

impl Encode for bool {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        match segment.next_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidTag(other)),
        }
    }
}

impl Encode for str {
    fn encode(&self, writer: &mut Writer) {
        writer.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut Writer) {
        writer.write_str(self);
    }
}

impl Decode for String {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        segment.read_str()
    }
}

impl Encode for [u8] {
    fn encode(&self, writer: &mut Writer) {
        writer.write_blob(self);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, writer: &mut Writer) {
        writer.write_blob(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(segment: &mut Segment<'_>) -> CodecResult<Self> {
        segment.read_blob()
    }
}
