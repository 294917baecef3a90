//! Partition and replication error types.

use shoal_core::NodeId;
use shoal_segment::SegmentError;
use thiserror::Error;

/// Result type for partition operations.
pub type PartitionResult<T> = Result<T, PartitionError>;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors from the replication layer.
///
/// Every variant means the entry was not committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// This replica is not the leader.
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The known leader, if any.
        leader_hint: Option<NodeId>,
    },

    /// The entry was not committed in time.
    #[error("replication timed out after {waited_ms}ms")]
    Timeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The replication layer is shutting down.
    #[error("replication layer shutting down")]
    ShuttingDown,
}

/// Partition operation errors.
#[derive(Debug, Clone, Error)]
pub enum PartitionError {
    /// Offset outside the bounds allowed for the operation.
    #[error("offset {offset} out of range (start {start}, high watermark {high_watermark})")]
    OffsetOutOfRange {
        /// Requested offset.
        offset: u64,
        /// Start offset at validation time.
        start: u64,
        /// High watermark at validation time.
        high_watermark: u64,
    },

    /// This replica is not the leader for the partition.
    #[error("not leader for partition (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The known leader, if any.
        leader_hint: Option<NodeId>,
    },

    /// An operation did not complete in time.
    #[error("{operation} timed out after {waited_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The partition is shutting down or was destroyed.
    #[error("partition is shutting down")]
    ShuttingDown,

    /// An append carried no records.
    #[error("append contains no records")]
    EmptyAppend,

    /// Persisted partition state is unreadable.
    #[error("corrupt partition state: {reason}")]
    CorruptState {
        /// Why the state was rejected.
        reason: &'static str,
    },

    /// Segment store failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Internal invariant violated.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl PartitionError {
    /// Returns true if the caller may retry, possibly against another leader.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::Timeout { .. } | Self::ShuttingDown
        )
    }

    /// Builds an out-of-range error.
    #[must_use]
    pub const fn out_of_range(offset: u64, start: u64, high_watermark: u64) -> Self {
        Self::OffsetOutOfRange {
            offset,
            start,
            high_watermark,
        }
    }
}

impl From<ReplicationError> for PartitionError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::NotLeader { leader_hint } => Self::NotLeader { leader_hint },
            ReplicationError::Timeout { waited_ms } => Self::Timeout {
                operation: "replicate",
                waited_ms,
            },
            ReplicationError::ShuttingDown => Self::ShuttingDown,
        }
    }
}
