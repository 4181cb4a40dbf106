//! Field values and their invertible tagged encoding.
//!
//! ```text
//! Null     | 0x01 |
//! False    | 0x02 |
//! True     | 0x03 |
//! Integer  | 0x04 | compressed(zigzag) | 0x04 |
//! Bytes    | 0x05 | compressed(len) | bytes | compressed(len) | 0x05 |
//! Text     | 0x06 | compressed(len) | utf-8 | compressed(len) | 0x06 |
//! ```
//!
//! Every form starts and ends with the same tag, so a value can be read from
//! either end without knowing its type in advance.

use crate::error::{CodecError, CodecResult};
use crate::varint;

/// Tag bytes of the value encoding.
pub mod tag {
    /// Null.
    pub const NULL: u8 = 0x01;
    /// Boolean false.
    pub const FALSE: u8 = 0x02;
    /// Boolean true.
    pub const TRUE: u8 = 0x03;
    /// Signed integer.
    pub const INTEGER: u8 = 0x04;
    /// Byte string.
    pub const BYTES: u8 = 0x05;
    /// UTF-8 string.
    pub const TEXT: u8 = 0x06;
}

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    Text(String),
}

/// The declared type of a field.
///
/// `Null` is not a kind; nullability is a separate property of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// [`Value::Bool`].
    Bool = 1,
    /// [`Value::Integer`].
    Integer = 2,
    /// [`Value::Bytes`].
    Bytes = 3,
    /// [`Value::Text`].
    Text = 4,
}

impl ValueKind {
    /// Returns the persisted code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a persisted code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Bool),
            2 => Some(Self::Integer),
            3 => Some(Self::Bytes),
            4 => Some(Self::Text),
            _ => None,
        }
    }

    /// Returns a lowercase name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Bytes => "bytes",
            Self::Text => "text",
        }
    }
}

impl Value {
    /// Returns the kind of a non-null value.
    #[must_use]
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ValueKind::Bool),
            Self::Integer(_) => Some(ValueKind::Integer),
            Self::Bytes(_) => Some(ValueKind::Bytes),
            Self::Text(_) => Some(ValueKind::Text),
        }
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the integer as unsigned, if this is a non-negative integer.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|n| u64::try_from(n).ok())
    }

    /// Returns the bytes, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the string, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the leading (and trailing) tag byte.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Null => tag::NULL,
            Self::Bool(false) => tag::FALSE,
            Self::Bool(true) => tag::TRUE,
            Self::Integer(_) => tag::INTEGER,
            Self::Bytes(_) => tag::BYTES,
            Self::Text(_) => tag::TEXT,
        }
    }

    /// Returns the number of bytes the encoded form occupies.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Integer(n) => 2 + varint::encoded_len(varint::zigzag_encode(*n)),
            Self::Bytes(b) => blob_len(b.len()),
            Self::Text(s) => blob_len(s.len()),
        }
    }

    /// Builds a value from its tag once the body has been read.
    pub(crate) fn from_single_tag(tag: u8) -> CodecResult<Option<Self>> {
        match tag {
            tag::NULL => Ok(Some(Self::Null)),
            tag::FALSE => Ok(Some(Self::Bool(false))),
            tag::TRUE => Ok(Some(Self::Bool(true))),
            tag::INTEGER | tag::BYTES | tag::TEXT => Ok(None),
            other => Err(CodecError::InvalidTag(other)),
        }
    }

    pub(crate) fn from_blob(tag: u8, bytes: Vec<u8>) -> CodecResult<Self> {
        if tag == tag::TEXT {
            String::from_utf8(bytes)
                .map(Self::Text)
                .map_err(|_| CodecError::InvalidUtf8)
        } else {
            Ok(Self::Bytes(bytes))
        }
    }
}

fn blob_len(len: usize) -> usize {
    let prefix = varint::encoded_len(len as u64);
    2 + 2 * prefix + len
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Value::Null.kind(), None);
        assert_eq!(Value::from(true).kind(), Some(ValueKind::Bool));
        assert_eq!(Value::from(3i64).kind(), Some(ValueKind::Integer));
        assert_eq!(Value::from("x").kind(), Some(ValueKind::Text));
        assert_eq!(Value::from(vec![1u8]).kind(), Some(ValueKind::Bytes));
    }

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            ValueKind::Bool,
            ValueKind::Integer,
            ValueKind::Bytes,
            ValueKind::Text,
        ] {
            assert_eq!(ValueKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(ValueKind::from_u8(0), None);
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".into()));
    }

    #[test]
    fn encoded_len_examples() {
        assert_eq!(Value::Null.encoded_len(), 1);
        assert_eq!(Value::Integer(-1).encoded_len(), 3);
        assert_eq!(Value::Integer(1000).encoded_len(), 6);
        assert_eq!(Value::Text("abc".into()).encoded_len(), 7);
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::Integer(-5).as_u64(), None);
        assert_eq!(Value::Integer(5).as_u64(), Some(5));
        assert_eq!(Value::Text("hi".into()).as_str(), Some("hi"));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(Value::from_single_tag(0x7f), Err(CodecError::InvalidTag(0x7f)));
    }
}
