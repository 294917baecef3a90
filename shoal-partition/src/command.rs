//! Commands replicated through a partition's command log.
//!
//! Every mutation of a partition is one of these commands. Replicas apply
//! them in log order, so they all reach the same records, watermarks and
//! open transactions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shoal_core::{Offset, ProducerId, Record};

const TAG_APPEND: u8 = 0;
const TAG_PREFIX_TRUNCATE: u8 = 1;
const TAG_END_TRANSACTION: u8 = 2;
const TAG_BARRIER: u8 = 3;

/// A partition command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionCommand {
    /// Append records, optionally inside a producer's transaction.
    Append {
        /// Transactional producer, if any.
        producer: Option<ProducerId>,
        /// Records to append. Offsets are assigned on apply.
        records: Vec<Record>,
    },
    /// Move the start offset forward to `offset`.
    PrefixTruncate {
        /// New start offset.
        offset: Offset,
    },
    /// Commit or abort a producer's transaction.
    EndTransaction {
        /// Producer whose transaction ends.
        producer: ProducerId,
        /// True for commit, false for abort.
        commit: bool,
    },
    /// No-op that marks a point in the command order.
    Barrier,
}

impl PartitionCommand {
    /// Encodes the command.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Append { producer, records } => {
                buf.put_u8(TAG_APPEND);
                match producer {
                    Some(p) => {
                        buf.put_u8(1);
                        buf.put_u64_le(p.get());
                    }
                    None => buf.put_u8(0),
                }
                #[allow(clippy::cast_possible_truncation)] // Bounded by batch limits.
                buf.put_u32_le(records.len() as u32);
                for record in records {
                    record.encode(&mut buf);
                }
            }
            Self::PrefixTruncate { offset } => {
                buf.put_u8(TAG_PREFIX_TRUNCATE);
                buf.put_u64_le(offset.get());
            }
            Self::EndTransaction { producer, commit } => {
                buf.put_u8(TAG_END_TRANSACTION);
                buf.put_u64_le(producer.get());
                buf.put_u8(u8::from(*commit));
            }
            Self::Barrier => buf.put_u8(TAG_BARRIER),
        }
        buf.freeze()
    }

    /// Decodes a command, returning `None` if the bytes are malformed.
    #[must_use]
    pub fn decode(data: &Bytes) -> Option<Self> {
        let mut buf = data.clone();
        if !buf.has_remaining() {
            return None;
        }
        let command = match buf.get_u8() {
            TAG_APPEND => {
                if buf.remaining() < 1 {
                    return None;
                }
                let producer = match buf.get_u8() {
                    0 => None,
                    1 if buf.remaining() >= 8 => Some(ProducerId::new(buf.get_u64_le())),
                    _ => return None,
                };
                if buf.remaining() < 4 {
                    return None;
                }
                let count = buf.get_u32_le() as usize;
                let mut records = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    records.push(Record::decode(&mut buf)?);
                }
                Self::Append { producer, records }
            }
            TAG_PREFIX_TRUNCATE => {
                if buf.remaining() < 8 {
                    return None;
                }
                Self::PrefixTruncate {
                    offset: Offset::new(buf.get_u64_le()),
                }
            }
            TAG_END_TRANSACTION => {
                if buf.remaining() < 9 {
                    return None;
                }
                let producer = ProducerId::new(buf.get_u64_le());
                let commit = match buf.get_u8() {
                    0 => false,
                    1 => true,
                    _ => return None,
                };
                Self::EndTransaction { producer, commit }
            }
            TAG_BARRIER => Self::Barrier,
            _ => return None,
        };
        // Trailing bytes mean a framing bug upstream.
        if buf.has_remaining() {
            return None;
        }
        Some(command)
    }

    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::PrefixTruncate { .. } => "prefix_truncate",
            Self::EndTransaction { .. } => "end_transaction",
            Self::Barrier => "barrier",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_append_decodes() {
        let command = PartitionCommand::Append {
            producer: Some(ProducerId::new(9)),
            records: vec![Record::new("a"), Record::with_key("k", "b")],
        };
        let decoded = PartitionCommand::decode(&command.encode()).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.kind(), "append");
    }

    #[test]
    fn test_truncate_and_end_transaction_decode() {
        for command in [
            PartitionCommand::PrefixTruncate {
                offset: Offset::new(125),
            },
            PartitionCommand::EndTransaction {
                producer: ProducerId::new(3),
                commit: false,
            },
            PartitionCommand::Barrier,
        ] {
            assert_eq!(PartitionCommand::decode(&command.encode()), Some(command));
        }
    }

    #[test]
    fn test_malformed_rejected() {
        assert_eq!(PartitionCommand::decode(&Bytes::new()), None);
        assert_eq!(PartitionCommand::decode(&Bytes::from_static(&[42])), None);
        assert_eq!(PartitionCommand::decode(&Bytes::from_static(&[1, 0, 0])), None);

        let mut trailing = PartitionCommand::Barrier.encode().to_vec();
        trailing.push(0);
        assert_eq!(PartitionCommand::decode(&Bytes::from(trailing)), None);
    }
}
