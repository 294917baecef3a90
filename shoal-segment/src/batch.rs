//! Record batch framing.
//!
//! Every append writes one batch to the active segment:
//!
//! ```text
//! +----------+----------+-----------+-------------+----------+----------+
//! |  CRC32   |  Length  | Log index | Base offset |  Count   | Records  |
//! | (4 bytes)| (4 bytes)| (8 bytes) |  (8 bytes)  | (4 bytes)| (N bytes)|
//! +----------+----------+-----------+-------------+----------+----------+
//! ```
//!
//! - CRC32 covers every following header field and the record bytes
//! - Length is the size of the record bytes only
//! - Log index is the replicated command that produced the batch, used to
//!   skip re-delivered appends after a restart
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shoal_core::{LogIndex, Offset, Record};

use crate::error::{SegmentError, SegmentResult};
use crate::limits::{BATCH_PAYLOAD_BYTES_MAX, BATCH_RECORDS_MAX};

/// Size of the batch header in bytes.
pub const BATCH_HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 4;

/// Batch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// CRC32 of the remaining header fields and the payload.
    pub crc: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// Replicated command index.
    pub log_index: LogIndex,
    /// Offset of the first record.
    pub base_offset: Offset,
    /// Number of records.
    pub record_count: u32,
}

impl BatchHeader {
    fn compute_crc(
        length: u32,
        log_index: LogIndex,
        base_offset: Offset,
        record_count: u32,
        payload: &[u8],
    ) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(&log_index.get().to_le_bytes());
        hasher.update(&base_offset.get().to_le_bytes());
        hasher.update(&record_count.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    /// Decodes a header. `position` is only used for error reporting.
    ///
    /// # Errors
    /// Returns `InvalidBatch` if the buffer is short or a field is out of range.
    pub fn decode(buf: &mut impl Buf, position: u64) -> SegmentResult<Self> {
        if buf.remaining() < BATCH_HEADER_SIZE {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "buffer too small for header",
            });
        }
        let header = Self {
            crc: buf.get_u32_le(),
            length: buf.get_u32_le(),
            log_index: LogIndex::new(buf.get_u64_le()),
            base_offset: Offset::new(buf.get_u64_le()),
            record_count: buf.get_u32_le(),
        };
        if header.length > BATCH_PAYLOAD_BYTES_MAX {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "length exceeds maximum",
            });
        }
        if header.record_count == 0 || header.record_count > BATCH_RECORDS_MAX {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "record count out of range",
            });
        }
        Ok(header)
    }

    /// Verifies the payload against the stored CRC.
    ///
    /// # Errors
    /// Returns `ChecksumMismatch` if they differ.
    pub fn verify(&self, payload: &[u8], position: u64) -> SegmentResult<()> {
        let actual = Self::compute_crc(
            self.length,
            self.log_index,
            self.base_offset,
            self.record_count,
            payload,
        );
        if actual != self.crc {
            return Err(SegmentError::ChecksumMismatch {
                position,
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }

    /// Offset following the last record of the batch.
    #[must_use]
    pub const fn next_offset(&self) -> Offset {
        self.base_offset.advance(self.record_count as u64)
    }

    /// Total encoded size including the header.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        BATCH_HEADER_SIZE as u64 + self.length as u64
    }
}

/// Records written by a single append, with offsets assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    /// Replicated command index.
    pub log_index: LogIndex,
    /// Offset of the first record.
    pub base_offset: Offset,
    /// Records in offset order.
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Builds a batch, assigning consecutive offsets from `base_offset`.
    #[must_use]
    pub fn new(log_index: LogIndex, base_offset: Offset, records: Vec<Record>) -> Self {
        let mut offset = base_offset;
        let records = records
            .into_iter()
            .map(|mut record| {
                record.offset = offset;
                offset = offset.next();
                record
            })
            .collect();
        Self {
            log_index,
            base_offset,
            records,
        }
    }

    /// Offset following the last record.
    #[must_use]
    pub fn next_offset(&self) -> Offset {
        self.base_offset.advance(self.records.len() as u64)
    }

    /// Encoded size including the header.
    #[must_use]
    pub fn encoded_size(&self) -> u64 {
        let payload: usize = self.records.iter().map(Record::encoded_size).sum();
        (BATCH_HEADER_SIZE + payload) as u64
    }

    /// Encodes header and records.
    ///
    /// # Errors
    /// Returns `BatchTooLarge` if the encoded records exceed the limit, or
    /// `InvalidBatch` if the batch is empty.
    pub fn encode(&self) -> SegmentResult<Bytes> {
        if self.records.is_empty() || self.records.len() > BATCH_RECORDS_MAX as usize {
            return Err(SegmentError::InvalidBatch {
                position: 0,
                reason: "record count out of range",
            });
        }
        let payload_size: usize = self.records.iter().map(Record::encoded_size).sum();
        if payload_size > BATCH_PAYLOAD_BYTES_MAX as usize {
            return Err(SegmentError::BatchTooLarge {
                size: payload_size as u64,
                max: u64::from(BATCH_PAYLOAD_BYTES_MAX),
            });
        }

        let mut payload = BytesMut::with_capacity(payload_size);
        for record in &self.records {
            record.encode(&mut payload);
        }

        #[allow(clippy::cast_possible_truncation)] // Both bounded by the limits above.
        let (length, record_count) = (payload_size as u32, self.records.len() as u32);
        let crc = BatchHeader::compute_crc(
            length,
            self.log_index,
            self.base_offset,
            record_count,
            &payload,
        );

        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE + payload_size);
        buf.put_u32_le(crc);
        buf.put_u32_le(length);
        buf.put_u64_le(self.log_index.get());
        buf.put_u64_le(self.base_offset.get());
        buf.put_u32_le(record_count);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes the records of a batch whose header was already read.
    ///
    /// # Errors
    /// Returns an error if the checksum fails or the records are malformed.
    pub fn decode_payload(
        header: &BatchHeader,
        payload: Bytes,
        position: u64,
    ) -> SegmentResult<Self> {
        header.verify(&payload, position)?;

        let mut buf = payload;
        let mut records = Vec::with_capacity(header.record_count as usize);
        for _ in 0..header.record_count {
            let record = Record::decode(&mut buf).ok_or(SegmentError::InvalidBatch {
                position,
                reason: "malformed record",
            })?;
            records.push(record);
        }
        if buf.has_remaining() {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "trailing bytes after records",
            });
        }

        Ok(Self {
            log_index: header.log_index,
            base_offset: header.base_offset,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordBatch {
        RecordBatch::new(
            LogIndex::new(7),
            Offset::new(100),
            vec![Record::new("a"), Record::with_key("k", "b"), Record::new("c")],
        )
    }

    #[test]
    fn test_new_assigns_offsets() {
        let batch = sample();
        let offsets: Vec<u64> = batch.records.iter().map(|r| r.offset.get()).collect();
        assert_eq!(offsets, vec![100, 101, 102]);
        assert_eq!(batch.next_offset(), Offset::new(103));
        assert_eq!(batch.encoded_size(), batch.encode().unwrap().len() as u64);
    }

    #[test]
    fn test_decode_encoded_batch() {
        let batch = sample();
        let mut encoded = batch.encode().unwrap();
        let header = BatchHeader::decode(&mut encoded, 0).unwrap();
        assert_eq!(header.record_count, 3);
        assert_eq!(header.next_offset(), Offset::new(103));
        assert_eq!(header.total_size(), (BATCH_HEADER_SIZE + encoded.len()) as u64);

        let decoded = RecordBatch::decode_payload(&header, encoded, 0).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let encoded = sample().encode().unwrap();
        let mut bytes = encoded.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let mut buf = Bytes::from(bytes);
        let header = BatchHeader::decode(&mut buf, 64).unwrap();
        let err = RecordBatch::decode_payload(&header, buf, 64).unwrap_err();
        assert!(matches!(err, SegmentError::ChecksumMismatch { position: 64, .. }));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let batch = RecordBatch::new(LogIndex::new(1), Offset::new(0), Vec::new());
        assert!(batch.encode().is_err());
    }
}
