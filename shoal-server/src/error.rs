//! Server error types and the wire-visible error codes.

use std::fmt;

use shoal_partition::PartitionError;

/// Error codes returned per partition in a delete-records response.
///
/// See: <https://kafka.apache.org/protocol#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    None,
    /// Requested offset outside the partition's bounds.
    OffsetOutOfRange,
    /// Topic or partition does not exist.
    UnknownTopicOrPartition,
    /// This node does not lead the partition.
    NotLeaderOrFollower,
    /// The request did not complete in time.
    RequestTimedOut,
    /// Anything else.
    UnknownServerError,
}

impl ErrorCode {
    /// Numeric Kafka error code.
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::None => 0,
            Self::OffsetOutOfRange => 1,
            Self::UnknownTopicOrPartition => 3,
            Self::NotLeaderOrFollower => 6,
            Self::RequestTimedOut => 7,
            Self::UnknownServerError => -1,
        }
    }

    /// Wire-visible name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "OK",
            Self::OffsetOutOfRange => "OFFSET_OUT_OF_RANGE",
            Self::UnknownTopicOrPartition => "UNKNOWN_TOPIC_OR_PARTITION",
            Self::NotLeaderOrFollower => "NOT_LEADER_OR_FOLLOWER",
            Self::RequestTimedOut => "REQUEST_TIMED_OUT",
            Self::UnknownServerError => "UNKNOWN_SERVER_ERROR",
        }
    }

    /// Returns true if a client should retry, possibly after refreshing
    /// leadership.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::NotLeaderOrFollower | Self::RequestTimedOut)
    }

    /// Looks up a numeric code.
    #[must_use]
    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::OffsetOutOfRange),
            3 => Some(Self::UnknownTopicOrPartition),
            6 => Some(Self::NotLeaderOrFollower),
            7 => Some(Self::RequestTimedOut),
            -1 => Some(Self::UnknownServerError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&PartitionError> for ErrorCode {
    fn from(err: &PartitionError) -> Self {
        match err {
            PartitionError::OffsetOutOfRange { .. } => Self::OffsetOutOfRange,
            PartitionError::NotLeader { .. } | PartitionError::ShuttingDown => {
                Self::NotLeaderOrFollower
            }
            PartitionError::Timeout { .. } => Self::RequestTimedOut,
            PartitionError::EmptyAppend
            | PartitionError::CorruptState { .. }
            | PartitionError::Segment(_)
            | PartitionError::Internal { .. } => Self::UnknownServerError,
        }
    }
}

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Topic not found.
    #[error("UNKNOWN_TOPIC_OR_PARTITION: topic not found: {topic}")]
    TopicNotFound {
        /// The topic name.
        topic: String,
    },

    /// Partition not found.
    #[error("UNKNOWN_TOPIC_OR_PARTITION: partition {partition} not found in topic {topic}")]
    PartitionNotFound {
        /// The topic name.
        topic: String,
        /// The partition index.
        partition: i32,
    },

    /// Topic already exists.
    #[error("topic already exists: {topic}")]
    TopicExists {
        /// The topic name.
        topic: String,
    },

    /// Topic name cannot be used.
    #[error("invalid topic name: {topic:?}")]
    InvalidTopicName {
        /// The topic name.
        topic: String,
    },

    /// Partition count outside the allowed range.
    #[error("invalid partition count {count} (max {max})")]
    InvalidPartitionCount {
        /// Requested count.
        count: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// Negative offset other than the high watermark sentinel.
    #[error("OFFSET_OUT_OF_RANGE: invalid offset {offset}")]
    InvalidOffset {
        /// The requested offset.
        offset: i64,
    },

    /// A partition operation failed.
    #[error("{}: {topic}/{partition}: {source}", ErrorCode::from(.source))]
    Partition {
        /// The topic name.
        topic: String,
        /// The partition index.
        partition: i32,
        /// Underlying error.
        source: PartitionError,
    },

    /// The response carried an error for the partition.
    #[error("{code}: {topic}/{partition}")]
    Rejected {
        /// The topic name.
        topic: String,
        /// The partition index.
        partition: i32,
        /// Returned error code.
        code: ErrorCode,
    },

    /// The response has no entry for a requested partition.
    #[error("partition was not returned: {topic}/{partition}")]
    PartitionNotReturned {
        /// The topic name.
        topic: String,
        /// The partition index.
        partition: i32,
    },
}

impl ServerError {
    /// Converts the error to a wire error code.
    #[must_use]
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::TopicNotFound { .. } | Self::PartitionNotFound { .. } => {
                ErrorCode::UnknownTopicOrPartition
            }
            Self::InvalidOffset { .. } => ErrorCode::OffsetOutOfRange,
            Self::Partition { source, .. } => ErrorCode::from(source),
            Self::Rejected { code, .. } => *code,
            Self::TopicExists { .. }
            | Self::InvalidTopicName { .. }
            | Self::InvalidPartitionCount { .. }
            | Self::PartitionNotReturned { .. } => ErrorCode::UnknownServerError,
        }
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::NodeId;

    #[test]
    fn test_partition_error_mapping() {
        let cases = [
            (
                PartitionError::out_of_range(10241, 0, 10240),
                ErrorCode::OffsetOutOfRange,
            ),
            (
                PartitionError::NotLeader {
                    leader_hint: Some(NodeId::new(2)),
                },
                ErrorCode::NotLeaderOrFollower,
            ),
            (PartitionError::ShuttingDown, ErrorCode::NotLeaderOrFollower),
            (
                PartitionError::Timeout {
                    operation: "replicate",
                    waited_ms: 5000,
                },
                ErrorCode::RequestTimedOut,
            ),
            (
                PartitionError::CorruptState { reason: "bad" },
                ErrorCode::UnknownServerError,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(ErrorCode::from(&err), code, "{err}");
        }
    }

    #[test]
    fn test_message_starts_with_code_name() {
        let err = ServerError::Partition {
            topic: "t".to_string(),
            partition: 0,
            source: PartitionError::out_of_range(0, 0, 1),
        };
        assert_eq!(err.to_error_code(), ErrorCode::OffsetOutOfRange);
        assert!(err.message().starts_with("OFFSET_OUT_OF_RANGE"));

        let err = ServerError::PartitionNotFound {
            topic: "t".to_string(),
            partition: 15,
        };
        assert!(err.message().starts_with("UNKNOWN_TOPIC_OR_PARTITION"));
    }

    #[test]
    fn test_codes() {
        for code in [
            ErrorCode::None,
            ErrorCode::OffsetOutOfRange,
            ErrorCode::UnknownTopicOrPartition,
            ErrorCode::NotLeaderOrFollower,
            ErrorCode::RequestTimedOut,
            ErrorCode::UnknownServerError,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(42), None);
        assert!(ErrorCode::NotLeaderOrFollower.is_retriable());
        assert!(!ErrorCode::OffsetOutOfRange.is_retriable());
    }
}
