//! Delete-records handler.
//!
//! Truncates every requested partition independently and concurrently. A
//! failure on one pair never affects another, and the response carries
//! exactly one entry per requested pair.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shoal_core::Offset;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, ServerError, ServerResult};
use crate::messages::{
    DeleteRecordsPartitionResult, DeleteRecordsRequest, DeleteRecordsResponse,
    DeleteRecordsTopicResult, HIGH_WATERMARK_OFFSET, LOW_WATERMARK_UNKNOWN,
};
use crate::registry::TopicRegistry;

/// Handles delete-records requests against a [`TopicRegistry`].
#[derive(Debug, Clone)]
pub struct DeleteRecordsHandler {
    registry: Arc<TopicRegistry>,
}

impl DeleteRecordsHandler {
    /// Creates a handler.
    #[must_use]
    pub const fn new(registry: Arc<TopicRegistry>) -> Self {
        Self { registry }
    }

    /// Processes a request.
    pub async fn handle(&self, request: &DeleteRecordsRequest) -> DeleteRecordsResponse {
        let timeout = if request.timeout_ms == 0 {
            self.registry.config().request_timeout
        } else {
            Duration::from_millis(u64::from(request.timeout_ms))
        };
        debug!(
            topics = request.topics.len(),
            pairs = request.pair_count(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Processing delete-records request"
        );

        let topics = request.topics.iter().map(|topic| async move {
            let partitions = join_all(topic.partitions.iter().map(|p| {
                self.delete_partition(&topic.name, p.partition, p.offset, timeout)
            }))
            .await;
            DeleteRecordsTopicResult {
                name: topic.name.clone(),
                partitions,
            }
        });

        DeleteRecordsResponse {
            topics: join_all(topics).await,
        }
    }

    async fn delete_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        timeout: Duration,
    ) -> DeleteRecordsPartitionResult {
        match self.truncate(topic, partition, offset, timeout).await {
            Ok(low_watermark) => {
                info!(
                    topic,
                    partition,
                    low_watermark = low_watermark.get(),
                    "Deleted records"
                );
                // Offsets stay far below i64::MAX.
                #[allow(clippy::cast_possible_wrap)]
                let low_watermark = low_watermark.get() as i64;
                DeleteRecordsPartitionResult {
                    partition,
                    low_watermark,
                    error_code: ErrorCode::None,
                }
            }
            Err(e) => {
                let error_code = e.to_error_code();
                if error_code == ErrorCode::UnknownServerError {
                    warn!(topic, partition, offset, error = %e, "Delete records failed");
                } else {
                    debug!(topic, partition, offset, error = %e, "Delete records rejected");
                }
                DeleteRecordsPartitionResult {
                    partition,
                    low_watermark: LOW_WATERMARK_UNKNOWN,
                    error_code,
                }
            }
        }
    }

    async fn truncate(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        timeout: Duration,
    ) -> ServerResult<Offset> {
        let target = self.registry.partition(topic, partition).await?;
        let log = target.log;

        let requested = if offset == HIGH_WATERMARK_OFFSET {
            log.high_watermark()
        } else {
            u64::try_from(offset)
                .map(Offset::new)
                .map_err(|_| ServerError::InvalidOffset { offset })?
        };

        log.request_truncate(requested, timeout)
            .await
            .map_err(|source| ServerError::Partition {
                topic: topic.to_string(),
                partition,
                source,
            })
    }
}
