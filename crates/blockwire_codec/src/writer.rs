//! Message and record writer.

use crate::chain::Chain;
use crate::error::{CodecError, CodecResult};
use crate::pool::BufferPool;
use crate::segment::Segment;
use crate::value::{tag, Value};
use crate::varint;

/// Length of a correlated message header: opcode, u32 payload length, u16 request id.
pub const CORRELATED_HEADER_LEN: usize = 7;
/// Offset of the payload length inside a correlated header.
pub const LENGTH_OFFSET: usize = 1;
/// Offset of the request id inside a correlated header.
pub const REQUEST_ID_OFFSET: usize = 5;

/// Appends encoded bytes to a pooled [`Chain`].
///
/// # Example
///
/// ```
/// use blockwire_codec::{BufferPool, Writer};
///
/// let mut writer = Writer::start_in(BufferPool::new(64), 9);
/// writer.write_compressed(300);
/// writer.write_str("hi");
/// assert_eq!(writer.to_vec(), vec![9, 251, 44, 1, 251, 2, b'h', b'i']);
/// ```
#[derive(Debug, Default)]
pub struct Writer {
    chain: Chain,
    correlated: bool,
}

impl Writer {
    /// Creates an empty writer on the global pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer on `pool`.
    pub fn with_pool(pool: BufferPool) -> Self {
        Self {
            chain: Chain::new(pool),
            correlated: false,
        }
    }

    /// Starts a message with `opcode` on the global pool.
    pub fn start(opcode: u8) -> Self {
        Self::start_in(BufferPool::default(), opcode)
    }

    /// Starts a message with `opcode` on `pool`.
    pub fn start_in(pool: BufferPool, opcode: u8) -> Self {
        let mut writer = Self::with_pool(pool);
        writer.write_u8(opcode);
        writer
    }

    /// Starts a correlated message on the global pool.
    ///
    /// Reserves the payload length and request id; call [`finish`](Self::finish)
    /// once the payload is written.
    pub fn start_correlated(opcode: u8) -> Self {
        Self::start_correlated_in(BufferPool::default(), opcode)
    }

    /// Starts a correlated message on `pool`.
    pub fn start_correlated_in(pool: BufferPool, opcode: u8) -> Self {
        let mut writer = Self::start_in(pool, opcode);
        writer.write_bytes(&[0; CORRELATED_HEADER_LEN - 1]);
        writer.correlated = true;
        writer
    }

    /// Returns true if the writer carries a correlated header.
    #[must_use]
    pub fn is_correlated(&self) -> bool {
        self.correlated
    }

    /// Returns the number of bytes written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.chain.extend_from_slice(&[value]);
    }

    /// Writes a little-endian u16.
    pub fn write_u16(&mut self, value: u16) {
        self.chain.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.chain.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.chain.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian i64.
    pub fn write_i64(&mut self, value: i64) {
        self.chain.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.chain.extend_from_slice(bytes);
    }

    /// Writes an invertible compressed integer.
    pub fn write_compressed(&mut self, value: u64) {
        let mut buf = [0u8; varint::MAX_ENCODED_LEN];
        let n = varint::encode(value, &mut buf);
        self.chain.extend_from_slice(&buf[..n]);
    }

    /// Writes a signed integer as zigzag + compressed.
    pub fn write_signed(&mut self, value: i64) {
        self.write_compressed(varint::zigzag_encode(value));
    }

    /// Writes a compressed length followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_compressed(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    /// Writes a compressed length followed by the UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    /// Writes a value in its invertible tagged form.
    pub fn write_value(&mut self, value: &Value) {
        let t = value.tag();
        match value {
            Value::Null | Value::Bool(_) => self.write_u8(t),
            Value::Integer(n) => {
                self.write_u8(tag::INTEGER);
                self.write_signed(*n);
                self.write_u8(tag::INTEGER);
            }
            Value::Bytes(b) => self.write_bracketed_blob(t, b),
            Value::Text(s) => self.write_bracketed_blob(t, s.as_bytes()),
        }
    }

    fn write_bracketed_blob(&mut self, t: u8, bytes: &[u8]) {
        self.write_u8(t);
        self.write_compressed(bytes.len() as u64);
        self.write_bytes(bytes);
        self.write_compressed(bytes.len() as u64);
        self.write_u8(t);
    }

    /// Overwrites previously written bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PatchOutOfRange`] if the range was not written.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> CodecResult<()> {
        self.chain.patch(offset, bytes)
    }

    /// Patches the payload length of a correlated message.
    ///
    /// A no-op for uncorrelated writers.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if the payload exceeds `u32::MAX`.
    pub fn finish(&mut self) -> CodecResult<()> {
        if !self.correlated {
            return Ok(());
        }
        let payload = self.len() - CORRELATED_HEADER_LEN;
        let length = u32::try_from(payload)
            .map_err(|_| CodecError::length_overflow(payload as u64, u64::from(u32::MAX)))?;
        self.chain.patch(LENGTH_OFFSET, &length.to_le_bytes())
    }

    /// Patches the request id of a correlated message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotCorrelated`] for uncorrelated writers.
    pub fn set_request_id(&mut self, id: u16) -> CodecResult<()> {
        if !self.correlated {
            return Err(CodecError::NotCorrelated);
        }
        self.chain.patch(REQUEST_ID_OFFSET, &id.to_le_bytes())
    }

    /// Returns the underlying chain.
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Consumes the writer, returning its chain.
    #[must_use]
    pub fn into_chain(self) -> Chain {
        self.chain
    }

    /// Returns a cursor over the written bytes.
    pub fn segment(&self) -> Segment<'_> {
        self.chain.segment()
    }

    /// Copies the written bytes into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.chain.to_vec()
    }
}
