//! Offsets and records.
//!
//! # Record Encoding
//!
//! ```text
//! +----------+-----------+----------+---------+----------+---------+
//! |  Offset  | Timestamp | Key len  |   Key   | Value len|  Value  |
//! | (8 bytes)| (8 bytes) | (4 bytes)| (N)     | (4 bytes)| (M)     |
//! +----------+-----------+----------+---------+----------+---------+
//! ```
//!
//! A key length of `-1` encodes "no key". Integers are little-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed-width part of an encoded record.
pub const RECORD_HEADER_SIZE: usize = 8 + 8 + 4 + 4;

/// Position of a record in a partition log.
///
/// Offsets are dense: every record appended to a partition receives the
/// next offset, starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// Creates an offset from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the following offset, saturating at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the offset `count` positions later, saturating at `u64::MAX`.
    #[must_use]
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Returns the preceding offset, or `None` at zero.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset assigned when the record is applied to the log.
    pub offset: Offset,
    /// Producer timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Optional key.
    pub key: Option<Bytes>,
    /// Payload.
    pub value: Bytes,
}

impl Record {
    /// Creates a keyless record. The offset is assigned on append.
    #[must_use]
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: Offset::default(),
            timestamp_ms: 0,
            key: None,
            value: value.into(),
        }
    }

    /// Creates a keyed record.
    #[must_use]
    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(value)
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Returns the encoded size in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.as_ref().map_or(0, Bytes::len) + self.value.len()
    }

    /// Encodes the record.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // Sizes bounded by segment limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.offset.get());
        buf.put_i64_le(self.timestamp_ms);
        match &self.key {
            Some(key) => {
                buf.put_i32_le(key.len() as i32);
                buf.put_slice(key);
            }
            None => buf.put_i32_le(-1),
        }
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    /// Decodes a record, returning `None` if the buffer is short or malformed.
    #[allow(clippy::cast_sign_loss)] // key_len is checked non-negative first.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 + 8 + 4 {
            return None;
        }
        let offset = Offset::new(buf.get_u64_le());
        let timestamp_ms = buf.get_i64_le();

        let key_len = buf.get_i32_le();
        let key = if key_len < 0 {
            None
        } else {
            if buf.remaining() < key_len as usize {
                return None;
            }
            Some(buf.copy_to_bytes(key_len as usize))
        };

        if buf.remaining() < 4 {
            return None;
        }
        let value_len = buf.get_u32_le() as usize;
        if buf.remaining() < value_len {
            return None;
        }
        let value = buf.copy_to_bytes(value_len);

        Some(Self {
            offset,
            timestamp_ms,
            key,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_prev_at_zero() {
        assert_eq!(Offset::new(0).prev(), None);
        assert_eq!(Offset::new(125).prev(), Some(Offset::new(124)));
    }

    #[test]
    fn test_offset_saturates() {
        assert_eq!(Offset::new(u64::MAX).next(), Offset::new(u64::MAX));
        assert_eq!(Offset::new(10).advance(5), Offset::new(15));
    }

    #[test]
    fn test_record_keyed_and_keyless() {
        let mut buf = BytesMut::new();
        let mut keyed = Record::with_key("k", "v1").with_timestamp_ms(7);
        keyed.offset = Offset::new(3);
        keyed.encode(&mut buf);
        Record::new("v2").encode(&mut buf);
        assert_eq!(buf.len(), keyed.encoded_size() + Record::new("v2").encoded_size());

        let mut bytes = buf.freeze();
        let first = Record::decode(&mut bytes).unwrap();
        let second = Record::decode(&mut bytes).unwrap();
        assert_eq!(first, keyed);
        assert_eq!(second.key, None);
        assert_eq!(second.value, Bytes::from("v2"));
        assert!(Record::decode(&mut bytes).is_none());
    }

    #[test]
    fn test_record_decode_truncated() {
        let mut buf = BytesMut::new();
        Record::new("payload").encode(&mut buf);
        let mut short = buf.freeze().slice(..RECORD_HEADER_SIZE + 2);
        assert!(Record::decode(&mut short).is_none());
    }
}
