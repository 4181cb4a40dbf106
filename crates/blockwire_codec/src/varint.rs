//! Invertible compressed integers.
//!
//! ```text
//! 0..=250            | value |
//! 251..=65535        | 251 | u16 LE | 251 |
//! ..=2^24-1          | 252 | u24 LE | 252 |
//! ..=2^32-1          | 253 | u32 LE | 253 |
//! ..=2^64-1          | 254 | u64 LE | 254 |
//! ```
//!
//! Multi-byte forms repeat the marker after the payload, so a reader that
//! starts at the last byte of an encoded integer and walks backward recovers
//! the same value as a forward reader. The encoding is canonical: every value
//! has exactly one valid form, and decoders reject longer ones. Marker 255 is
//! reserved.

use crate::error::{CodecError, CodecResult};

/// Largest value stored directly in a single byte.
pub const MAX_SINGLE_BYTE: u8 = 250;
/// Marker for a 2-byte payload.
pub const MARKER_U16: u8 = 251;
/// Marker for a 3-byte payload.
pub const MARKER_U24: u8 = 252;
/// Marker for a 4-byte payload.
pub const MARKER_U32: u8 = 253;
/// Marker for an 8-byte payload.
pub const MARKER_U64: u8 = 254;
/// Reserved marker, never written.
pub const MARKER_RESERVED: u8 = 255;
/// Longest possible encoding (marker + 8 bytes + marker).
pub const MAX_ENCODED_LEN: usize = 10;

/// Returns the number of bytes `value` occupies when encoded.
#[must_use]
pub const fn encoded_len(value: u64) -> usize {
    if value <= MAX_SINGLE_BYTE as u64 {
        1
    } else if value <= 0xFFFF {
        4
    } else if value <= 0xFF_FFFF {
        5
    } else if value <= 0xFFFF_FFFF {
        6
    } else {
        10
    }
}

/// Returns the payload width introduced by `marker` (0 for single-byte values).
///
/// # Errors
///
/// Returns [`CodecError::ReservedMarker`] for 255.
pub fn payload_width(marker: u8) -> CodecResult<usize> {
    match marker {
        MARKER_U16 => Ok(2),
        MARKER_U24 => Ok(3),
        MARKER_U32 => Ok(4),
        MARKER_U64 => Ok(8),
        MARKER_RESERVED => Err(CodecError::ReservedMarker),
        _ => Ok(0),
    }
}

/// Returns the full encoded length implied by a marker byte.
///
/// # Errors
///
/// Returns [`CodecError::ReservedMarker`] for 255.
pub fn len_from_marker(marker: u8) -> CodecResult<usize> {
    match payload_width(marker) {
        Ok(0) => Ok(1),
        Ok(width) => Ok(width + 2),
        Err(e) => Err(e),
    }
}

/// Encodes `value` into `out`, returning the number of bytes used.
#[allow(clippy::cast_possible_truncation)]
pub fn encode(value: u64, out: &mut [u8; MAX_ENCODED_LEN]) -> usize {
    let (marker, width) = if value <= u64::from(MAX_SINGLE_BYTE) {
        out[0] = value as u8;
        return 1;
    } else if value <= 0xFFFF {
        (MARKER_U16, 2)
    } else if value <= 0xFF_FFFF {
        (MARKER_U24, 3)
    } else if value <= 0xFFFF_FFFF {
        (MARKER_U32, 4)
    } else {
        (MARKER_U64, 8)
    };

    out[0] = marker;
    out[1..=width].copy_from_slice(&value.to_le_bytes()[..width]);
    out[width + 1] = marker;
    width + 2
}

/// Assembles a multi-byte value from its leading marker, payload and trailing marker.
///
/// # Errors
///
/// Returns an error if the markers differ or the value is not canonical.
pub fn from_parts(leading: u8, payload: &[u8], trailing: u8) -> CodecResult<u64> {
    if leading != trailing {
        return Err(CodecError::MarkerMismatch { leading, trailing });
    }
    let mut le = [0u8; 8];
    le[..payload.len()].copy_from_slice(payload);
    let value = u64::from_le_bytes(le);
    if encoded_len(value) != payload.len() + 2 {
        return Err(CodecError::NonCanonical {
            marker: leading,
            value,
        });
    }
    Ok(value)
}

/// Decodes an integer from the start of `bytes`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`CodecError::UnexpectedEof`] if `bytes` is too short, or a
/// structural error for reserved, mismatched or non-canonical encodings.
pub fn decode(bytes: &[u8]) -> CodecResult<(u64, usize)> {
    let &marker = bytes.first().ok_or(CodecError::UnexpectedEof)?;
    let width = payload_width(marker)?;
    if width == 0 {
        return Ok((u64::from(marker), 1));
    }
    let total = width + 2;
    if bytes.len() < total {
        return Err(CodecError::UnexpectedEof);
    }
    let value = from_parts(marker, &bytes[1..=width], bytes[width + 1])?;
    Ok((value, total))
}

/// Decodes an integer that ends at the last byte of `bytes`.
///
/// Returns the value and the number of bytes consumed from the end.
///
/// # Errors
///
/// Same as [`decode`].
pub fn decode_backward(bytes: &[u8]) -> CodecResult<(u64, usize)> {
    let &trailing = bytes.last().ok_or(CodecError::UnexpectedEof)?;
    let width = payload_width(trailing)?;
    if width == 0 {
        return Ok((u64::from(trailing), 1));
    }
    let total = width + 2;
    if bytes.len() < total {
        return Err(CodecError::UnexpectedEof);
    }
    let start = bytes.len() - total;
    let value = from_parts(bytes[start], &bytes[start + 1..=start + width], trailing)?;
    Ok((value, total))
}

/// Maps a signed integer onto an unsigned one so small magnitudes stay short.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
