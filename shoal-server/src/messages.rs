//! Delete-records request and response.
//!
//! Requests batch `(topic, partition) -> offset` pairs. The response carries
//! one entry per requested pair; a client must treat a pair missing from the
//! response as a failure, which [`DeleteRecordsResponse::outcome`] does.

use shoal_core::Offset;

use crate::error::{ErrorCode, ServerError, ServerResult};

/// Offset sentinel meaning "the current high watermark".
pub const HIGH_WATERMARK_OFFSET: i64 = -1;

/// Low watermark reported for a failed partition.
pub const LOW_WATERMARK_UNKNOWN: i64 = -1;

/// One partition to truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRecordsPartition {
    /// Partition index.
    pub partition: i32,
    /// Records below this offset are deleted; [`HIGH_WATERMARK_OFFSET`]
    /// deletes everything.
    pub offset: i64,
}

/// Partitions of one topic to truncate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecordsTopic {
    /// Topic name.
    pub name: String,
    /// Partitions of the topic.
    pub partitions: Vec<DeleteRecordsPartition>,
}

/// A delete-records request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRecordsRequest {
    /// Topics to truncate.
    pub topics: Vec<DeleteRecordsTopic>,
    /// How long to wait for each truncation; 0 uses the server default.
    pub timeout_ms: u32,
}

impl DeleteRecordsRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            topics: Vec::new(),
            timeout_ms,
        }
    }

    /// Adds a `(topic, partition) -> offset` pair.
    #[must_use]
    pub fn with_offset(mut self, topic: &str, partition: i32, offset: i64) -> Self {
        let entry = DeleteRecordsPartition { partition, offset };
        if let Some(t) = self.topics.iter_mut().find(|t| t.name == topic) {
            t.partitions.push(entry);
        } else {
            self.topics.push(DeleteRecordsTopic {
                name: topic.to_string(),
                partitions: vec![entry],
            });
        }
        self
    }

    /// Number of `(topic, partition)` pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }
}

/// Result for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRecordsPartitionResult {
    /// Partition index.
    pub partition: i32,
    /// New start offset, or [`LOW_WATERMARK_UNKNOWN`] on failure.
    pub low_watermark: i64,
    /// Outcome.
    pub error_code: ErrorCode,
}

/// Results for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecordsTopicResult {
    /// Topic name.
    pub name: String,
    /// Per-partition results, in request order.
    pub partitions: Vec<DeleteRecordsPartitionResult>,
}

/// A delete-records response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRecordsResponse {
    /// Per-topic results, in request order.
    pub topics: Vec<DeleteRecordsTopicResult>,
}

impl DeleteRecordsResponse {
    /// Looks up the entry for a pair.
    #[must_use]
    pub fn get(&self, topic: &str, partition: i32) -> Option<&DeleteRecordsPartitionResult> {
        self.topics
            .iter()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition == partition)
    }

    /// Client-side view of one pair: the new low watermark, or the error.
    ///
    /// # Errors
    /// Returns `Rejected` with the returned code, or `PartitionNotReturned`
    /// if the response has no entry for the pair.
    pub fn outcome(&self, topic: &str, partition: i32) -> ServerResult<Offset> {
        let Some(result) = self.get(topic, partition) else {
            return Err(ServerError::PartitionNotReturned {
                topic: topic.to_string(),
                partition,
            });
        };
        match (result.error_code, u64::try_from(result.low_watermark)) {
            (ErrorCode::None, Ok(low_watermark)) => Ok(Offset::new(low_watermark)),
            (ErrorCode::None, Err(_)) => Err(ServerError::Rejected {
                topic: topic.to_string(),
                partition,
                code: ErrorCode::UnknownServerError,
            }),
            (code, _) => Err(ServerError::Rejected {
                topic: topic.to_string(),
                partition,
                code,
            }),
        }
    }

    /// Number of partition entries.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_groups_by_topic() {
        let request = DeleteRecordsRequest::new(0)
            .with_offset("a", 0, 5)
            .with_offset("b", 0, 1)
            .with_offset("a", 1, HIGH_WATERMARK_OFFSET);
        assert_eq!(request.topics.len(), 2);
        assert_eq!(request.topics[0].partitions.len(), 2);
        assert_eq!(request.pair_count(), 3);
    }

    #[test]
    fn test_outcome_validates_response() {
        let response = DeleteRecordsResponse {
            topics: vec![DeleteRecordsTopicResult {
                name: "t".to_string(),
                partitions: vec![
                    DeleteRecordsPartitionResult {
                        partition: 0,
                        low_watermark: 125,
                        error_code: ErrorCode::None,
                    },
                    DeleteRecordsPartitionResult {
                        partition: 1,
                        low_watermark: LOW_WATERMARK_UNKNOWN,
                        error_code: ErrorCode::OffsetOutOfRange,
                    },
                ],
            }],
        };

        assert_eq!(response.outcome("t", 0).unwrap(), Offset::new(125));

        let err = response.outcome("t", 1).unwrap_err();
        assert_eq!(err.to_error_code(), ErrorCode::OffsetOutOfRange);
        assert!(err.message().starts_with("OFFSET_OUT_OF_RANGE"));

        let err = response.outcome("t", 15).unwrap_err();
        assert!(err.message().contains("partition was not returned"));
        assert!(matches!(err, ServerError::PartitionNotReturned { partition: 15, .. }));
    }
}
