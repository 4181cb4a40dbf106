//! Two-ended read cursor over a chain.
//!
//! A segment reads forward from its front cursor and backward from its back
//! cursor; the two never cross. Multi-byte reads are all-or-nothing: a read
//! that fails leaves both cursors where they were, so a streaming caller can
//! retry once more bytes have arrived.

use crate::chain::Chain;
use crate::error::{CodecError, CodecResult};
use crate::pool::BufferPool;
use crate::value::{tag, Value};
use crate::varint;
use bytes::Bytes;
use std::fmt::{self, Write as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    block: usize,
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    front: Cursor,
    back: Cursor,
    remaining: usize,
    front_consumed: usize,
    back_consumed: usize,
}

enum Source<'a> {
    Borrowed(&'a Chain),
    Owned(Chain),
}

impl Source<'_> {
    fn chain(&self) -> &Chain {
        match self {
            Source::Borrowed(chain) => chain,
            Source::Owned(chain) => chain,
        }
    }
}

/// A read cursor over the unconsumed bytes of a [`Chain`].
pub struct Segment<'a> {
    source: Source<'a>,
    pos: Position,
}

impl<'a> Segment<'a> {
    /// Creates a segment over `chain`.
    pub fn new(chain: &'a Chain) -> Self {
        Self::over(Source::Borrowed(chain))
    }

    fn over(source: Source<'a>) -> Self {
        let chain = source.chain();
        let blocks = chain.block_count();
        let back = if blocks == 0 {
            Cursor {
                block: 0,
                offset: 0,
            }
        } else {
            Cursor {
                block: blocks - 1,
                offset: chain.block_slice(blocks - 1).len(),
            }
        };
        let pos = Position {
            front: Cursor {
                block: 0,
                offset: chain.head(),
            },
            back,
            remaining: chain.len(),
            front_consumed: 0,
            back_consumed: 0,
        };
        Self { source, pos }
    }

    fn slice(&self, block: usize) -> &[u8] {
        self.source.chain().block_slice(block)
    }

    fn pool(&self) -> &BufferPool {
        self.source.chain().pool()
    }

    /// Runs `f`, rewinding both cursors if it fails.
    fn atomic<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        let saved = self.pos;
        let result = f(self);
        if result.is_err() {
            self.pos = saved;
        }
        result
    }

    /// Returns the number of unread bytes between the cursors.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pos.remaining
    }

    /// Returns true if no bytes remain between the cursors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos.remaining == 0
    }

    /// Returns the number of bytes read from the front.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.pos.front_consumed
    }

    /// Returns the number of bytes read from the back.
    #[must_use]
    pub fn consumed_back(&self) -> usize {
        self.pos.back_consumed
    }

    /// Returns true if this segment owns private blocks.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        matches!(self.source, Source::Owned(_))
    }

    fn require(&self, n: usize) -> CodecResult<()> {
        if self.pos.remaining < n {
            Err(CodecError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    /// Reads one byte from the front.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if the segment is empty.
    pub fn next_byte(&mut self) -> CodecResult<u8> {
        self.require(1)?;
        loop {
            let Cursor { block, offset } = self.pos.front;
            let slice = self.slice(block);
            if offset < slice.len() {
                let byte = slice[offset];
                self.pos.front.offset += 1;
                self.pos.remaining -= 1;
                self.pos.front_consumed += 1;
                return Ok(byte);
            }
            self.pos.front = Cursor {
                block: block + 1,
                offset: 0,
            };
        }
    }

    /// Returns the next byte without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        if self.pos.remaining == 0 {
            return None;
        }
        let Cursor { mut block, mut offset } = self.pos.front;
        loop {
            let slice = self.slice(block);
            if offset < slice.len() {
                return Some(slice[offset]);
            }
            block += 1;
            offset = 0;
        }
    }

    /// Reads one byte from the back.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if the segment is empty.
    pub fn prev_byte(&mut self) -> CodecResult<u8> {
        self.require(1)?;
        loop {
            let Cursor { block, offset } = self.pos.back;
            if offset > 0 {
                let byte = self.slice(block)[offset - 1];
                self.pos.back.offset -= 1;
                self.pos.remaining -= 1;
                self.pos.back_consumed += 1;
                return Ok(byte);
            }
            let prev = block - 1;
            self.pos.back = Cursor {
                block: prev,
                offset: self.slice(prev).len(),
            };
        }
    }

    /// Returns the last byte without consuming it.
    #[must_use]
    pub fn peek_back(&self) -> Option<u8> {
        if self.pos.remaining == 0 {
            return None;
        }
        let Cursor { mut block, mut offset } = self.pos.back;
        loop {
            if offset > 0 {
                return Some(self.slice(block)[offset - 1]);
            }
            block -= 1;
            offset = self.slice(block).len();
        }
    }

    /// Fills `target` from the front, copying whole slices per block.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] (consuming nothing) if fewer
    /// than `target.len()` bytes remain.
    pub fn copy_into(&mut self, target: &mut [u8]) -> CodecResult<()> {
        self.require(target.len())?;
        let mut filled = 0;
        while filled < target.len() {
            let Cursor { block, offset } = self.pos.front;
            let slice = self.slice(block);
            let available = slice.len() - offset;
            if available == 0 {
                self.pos.front = Cursor {
                    block: block + 1,
                    offset: 0,
                };
                continue;
            }
            let n = available.min(target.len() - filled);
            target[filled..filled + n].copy_from_slice(&slice[offset..offset + n]);
            filled += n;
            self.pos.front.offset += n;
        }
        self.pos.remaining -= filled;
        self.pos.front_consumed += filled;
        Ok(())
    }

    /// Reads `n` bytes from the front into a vector.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if fewer than `n` bytes remain.
    pub fn read_exact(&mut self, n: usize) -> CodecResult<Vec<u8>> {
        self.require(n)?;
        let mut out = vec![0u8; n];
        self.copy_into(&mut out)?;
        Ok(out)
    }

    /// Skips `n` bytes from the front.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> CodecResult<()> {
        self.require(n)?;
        let mut left = n;
        while left > 0 {
            let Cursor { block, offset } = self.pos.front;
            let available = self.slice(block).len() - offset;
            if available == 0 {
                self.pos.front = Cursor {
                    block: block + 1,
                    offset: 0,
                };
                continue;
            }
            let step = available.min(left);
            self.pos.front.offset += step;
            left -= step;
        }
        self.pos.remaining -= n;
        self.pos.front_consumed += n;
        Ok(())
    }

    /// Skips `n` bytes from the back.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if fewer than `n` bytes remain.
    pub fn skip_back(&mut self, n: usize) -> CodecResult<()> {
        self.require(n)?;
        for _ in 0..n {
            self.prev_byte()?;
        }
        Ok(())
    }

    /// Reads a little-endian u16.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if too few bytes remain.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        let mut buf = [0u8; 2];
        self.copy_into(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian u32.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if too few bytes remain.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let mut buf = [0u8; 4];
        self.copy_into(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian u64.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if too few bytes remain.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let mut buf = [0u8; 8];
        self.copy_into(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads an invertible compressed integer from the front.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if the encoding is incomplete,
    /// or a structural error for reserved, mismatched or non-canonical forms.
    pub fn read_compressed(&mut self) -> CodecResult<u64> {
        let marker = self.peek().ok_or(CodecError::UnexpectedEof)?;
        let total = varint::len_from_marker(marker)?;
        self.require(total)?;
        let mut buf = [0u8; varint::MAX_ENCODED_LEN];
        self.atomic(|seg| {
            seg.copy_into(&mut buf[..total])?;
            varint::decode(&buf[..total]).map(|(value, _)| value)
        })
    }

    /// Reads an invertible compressed integer from the back.
    ///
    /// # Errors
    ///
    /// Same as [`read_compressed`](Self::read_compressed).
    pub fn read_compressed_back(&mut self) -> CodecResult<u64> {
        let marker = self.peek_back().ok_or(CodecError::UnexpectedEof)?;
        let total = varint::len_from_marker(marker)?;
        self.require(total)?;
        self.atomic(|seg| {
            let mut buf = [0u8; varint::MAX_ENCODED_LEN];
            for i in (0..total).rev() {
                buf[i] = seg.prev_byte()?;
            }
            varint::decode_backward(&buf[..total]).map(|(value, _)| value)
        })
    }

    /// Reads a zigzag-encoded signed integer.
    ///
    /// # Errors
    ///
    /// Same as [`read_compressed`](Self::read_compressed).
    pub fn read_signed(&mut self) -> CodecResult<i64> {
        self.read_compressed().map(varint::zigzag_decode)
    }

    fn read_len(&mut self) -> CodecResult<usize> {
        let len = self.read_compressed()?;
        usize::try_from(len).map_err(|_| CodecError::length_overflow(len, usize::MAX as u64))
    }

    fn read_len_back(&mut self) -> CodecResult<usize> {
        let len = self.read_compressed_back()?;
        usize::try_from(len).map_err(|_| CodecError::length_overflow(len, usize::MAX as u64))
    }

    /// Reads a compressed length followed by that many bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if the blob is incomplete.
    pub fn read_blob(&mut self) -> CodecResult<Vec<u8>> {
        self.atomic(|seg| {
            let len = seg.read_len()?;
            seg.read_exact(len)
        })
    }

    /// Reads a compressed length followed by that many UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidUtf8`] for malformed text, otherwise as
    /// [`read_blob`](Self::read_blob).
    pub fn read_str(&mut self) -> CodecResult<String> {
        self.atomic(|seg| {
            let bytes = seg.read_blob()?;
            String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
        })
    }

    /// Reads a tagged value from the front.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if the value is incomplete, or a
    /// structural error for unknown or mismatched tags and lengths.
    pub fn read_value(&mut self) -> CodecResult<Value> {
        self.atomic(|seg| {
            let leading = seg.next_byte()?;
            if let Some(value) = Value::from_single_tag(leading)? {
                return Ok(value);
            }
            let value = if leading == tag::INTEGER {
                Value::Integer(seg.read_signed()?)
            } else {
                let len = seg.read_len()?;
                let bytes = seg.read_exact(len)?;
                let trailing_len = seg.read_compressed()?;
                if trailing_len != len as u64 {
                    return Err(CodecError::LengthMismatch {
                        leading: len as u64,
                        trailing: trailing_len,
                    });
                }
                Value::from_blob(leading, bytes)?
            };
            let trailing = seg.next_byte()?;
            if trailing != leading {
                return Err(CodecError::TagMismatch { leading, trailing });
            }
            Ok(value)
        })
    }

    /// Reads a tagged value from the back.
    ///
    /// # Errors
    ///
    /// Same as [`read_value`](Self::read_value).
    pub fn read_value_back(&mut self) -> CodecResult<Value> {
        self.atomic(|seg| {
            let trailing = seg.prev_byte()?;
            if let Some(value) = Value::from_single_tag(trailing)? {
                return Ok(value);
            }
            let value = if trailing == tag::INTEGER {
                Value::Integer(varint::zigzag_decode(seg.read_compressed_back()?))
            } else {
                let len = seg.read_len_back()?;
                seg.require(len)?;
                let mut bytes = vec![0u8; len];
                for slot in bytes.iter_mut().rev() {
                    *slot = seg.prev_byte()?;
                }
                let leading_len = seg.read_compressed_back()?;
                if leading_len != len as u64 {
                    return Err(CodecError::LengthMismatch {
                        leading: leading_len,
                        trailing: len as u64,
                    });
                }
                Value::from_blob(trailing, bytes)?
            };
            let leading = seg.prev_byte()?;
            if leading != trailing {
                return Err(CodecError::TagMismatch { leading, trailing });
            }
            Ok(value)
        })
    }

    /// Returns a segment that owns a private copy of the remaining bytes.
    ///
    /// The copy outlives the source chain; this segment is not advanced.
    #[must_use]
    pub fn copy(&self) -> Segment<'static> {
        let mut chain = Chain::new(self.pool().clone());
        self.for_each_slice(|slice| chain.extend_from_slice(slice));
        Segment::over(Source::Owned(chain))
    }

    fn for_each_slice(&self, mut f: impl FnMut(&[u8])) {
        let mut left = self.pos.remaining;
        let Cursor { mut block, mut offset } = self.pos.front;
        while left > 0 {
            let slice = self.slice(block);
            let n = (slice.len() - offset).min(left);
            if n > 0 {
                f(&slice[offset..offset + n]);
            }
            left -= n;
            block += 1;
            offset = 0;
        }
    }

    /// Copies the remaining bytes into a vector without advancing.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pos.remaining);
        self.for_each_slice(|slice| out.extend_from_slice(slice));
        out
    }

    /// Copies the remaining bytes into a shareable buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_vec())
    }

    /// Renders the remaining bytes as space-separated hex pairs.
    #[must_use]
    pub fn as_hex(&self) -> String {
        let mut out = String::with_capacity(self.pos.remaining * 3);
        self.for_each_slice(|slice| {
            for byte in slice {
                if !out.is_empty() {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x}");
            }
        });
        out
    }

    /// Renders the remaining bytes as printable ASCII with `\xNN` escapes.
    #[must_use]
    pub fn as_escaped(&self) -> String {
        let mut out = String::with_capacity(self.pos.remaining);
        self.for_each_slice(|slice| {
            for &byte in slice {
                match byte {
                    b'\\' => out.push_str("\\\\"),
                    0x20..=0x7e => out.push(char::from(byte)),
                    _ => {
                        let _ = write!(out, "\\x{byte:02x}");
                    }
                }
            }
        });
        out
    }
}

impl Segment<'static> {
    /// Creates a segment that owns `chain`.
    pub fn from_chain(chain: Chain) -> Self {
        Self::over(Source::Owned(chain))
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("remaining", &self.pos.remaining)
            .field("consumed", &self.pos.front_consumed)
            .field("is_copy", &self.is_copy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Writer;
    use proptest::prelude::*;

    fn chain_of(bytes: &[u8], block_size: usize) -> Chain {
        Chain::from_slice(BufferPool::new(block_size), bytes)
    }

    #[test]
    fn next_byte_rolls_across_blocks() {
        let chain = chain_of(b"0123456789", 8);
        let mut seg = chain.segment();
        let mut out = Vec::new();
        while let Ok(b) = seg.next_byte() {
            out.push(b);
        }
        assert_eq!(out, b"0123456789");
        assert_eq!(seg.consumed(), 10);
    }

    #[test]
    fn front_and_back_meet() {
        let chain = chain_of(b"abcdefghij", 8);
        let mut seg = chain.segment();
        assert_eq!(seg.next_byte(), Ok(b'a'));
        assert_eq!(seg.prev_byte(), Ok(b'j'));
        assert_eq!(seg.prev_byte(), Ok(b'i'));
        assert_eq!(seg.prev_byte(), Ok(b'h'));
        assert_eq!(seg.remaining(), 6);
        assert_eq!(seg.to_vec(), b"bcdefg");
    }

    #[test]
    fn head_offset_is_respected() {
        let mut chain = chain_of(b"0123456789", 8);
        chain.consume(3);
        let seg = chain.segment();
        assert_eq!(seg.peek(), Some(b'3'));
        assert_eq!(seg.to_vec(), b"3456789");
    }

    #[test]
    fn short_read_consumes_nothing() {
        let mut w = Writer::with_pool(BufferPool::new(8));
        w.write_u8(varint::MARKER_U32);
        w.write_bytes(&[1, 2]);
        let mut seg = w.segment();
        assert_eq!(seg.read_compressed(), Err(CodecError::UnexpectedEof));
        assert_eq!(seg.consumed(), 0);
        assert_eq!(seg.read_u32(), Err(CodecError::UnexpectedEof));
        assert_eq!(seg.remaining(), 3);
    }

    #[test]
    fn blob_rewinds_on_eof() {
        let mut w = Writer::with_pool(BufferPool::new(8));
        w.write_compressed(5);
        w.write_bytes(b"abc");
        let mut seg = w.segment();
        assert_eq!(seg.read_blob(), Err(CodecError::UnexpectedEof));
        assert_eq!(seg.consumed(), 0);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut w = Writer::with_pool(BufferPool::new(8));
        w.write_blob(&[0xff, 0xfe]);
        assert_eq!(w.segment().read_str(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn tag_mismatch_detected() {
        let bytes = [tag::INTEGER, 2, tag::TEXT];
        let chain = chain_of(&bytes, 8);
        assert_eq!(
            chain.segment().read_value(),
            Err(CodecError::TagMismatch {
                leading: tag::INTEGER,
                trailing: tag::TEXT
            })
        );
    }

    #[test]
    fn blob_length_mismatch_detected() {
        let bytes = [tag::BYTES, 1, 9, 2, tag::BYTES];
        let chain = chain_of(&bytes, 8);
        assert_eq!(
            chain.segment().read_value(),
            Err(CodecError::LengthMismatch {
                leading: 1,
                trailing: 2
            })
        );
    }

    #[test]
    fn copy_outlives_source() {
        let pool = BufferPool::new(8);
        let chain = Chain::from_slice(pool.clone(), b"hello, world");
        let mut seg = chain.segment();
        seg.skip(7).unwrap();
        let copy = seg.copy();
        drop(seg);
        drop(chain);
        assert!(copy.is_copy());
        assert_eq!(copy.to_vec(), b"world");
        drop(copy);
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn debug_views() {
        let chain = chain_of(b"a\x00\\", 8);
        let seg = chain.segment();
        assert_eq!(seg.as_hex(), "61 00 5c");
        assert_eq!(seg.as_escaped(), "a\\x00\\\\");
    }

    #[test]
    fn empty_chain_segment() {
        let chain = Chain::new(BufferPool::new(8));
        let mut seg = chain.segment();
        assert!(seg.is_empty());
        assert_eq!(seg.next_byte(), Err(CodecError::UnexpectedEof));
        assert_eq!(seg.prev_byte(), Err(CodecError::UnexpectedEof));
        assert_eq!(seg.peek_back(), None);
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            proptest::collection::vec(any::<u8>(), 0..300).prop_map(Value::Bytes),
            ".{0,40}".prop_map(Value::Text),
        ]
    }

    proptest! {
        #[test]
        fn values_read_same_from_both_ends(
            values in proptest::collection::vec(value_strategy(), 1..12),
            block_size in 8usize..40,
        ) {
            let mut w = Writer::with_pool(BufferPool::new(block_size));
            for v in &values {
                w.write_value(v);
            }

            let mut seg = w.segment();
            let mut forward = Vec::new();
            while !seg.is_empty() {
                forward.push(seg.read_value().unwrap());
            }
            prop_assert_eq!(&forward, &values);

            let mut seg = w.segment();
            let mut backward = Vec::new();
            while !seg.is_empty() {
                backward.push(seg.read_value_back().unwrap());
            }
            backward.reverse();
            prop_assert_eq!(backward, values);
        }

        #[test]
        fn split_reads_match_unsplit(
            numbers in proptest::collection::vec(any::<u64>(), 1..20),
            block_size in 8usize..24,
        ) {
            let mut w = Writer::with_pool(BufferPool::new(block_size));
            for n in &numbers {
                w.write_compressed(*n);
            }
            let flat = w.to_vec();
            let whole = chain_of(&flat, 4096);

            let mut split = w.segment();
            let mut unsplit = whole.segment();
            for n in &numbers {
                prop_assert_eq!(split.read_compressed(), Ok(*n));
                prop_assert_eq!(unsplit.read_compressed(), Ok(*n));
            }
            prop_assert!(split.is_empty());
        }
    }
}
