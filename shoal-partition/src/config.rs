//! Partition log configuration.

use std::path::PathBuf;
use std::time::Duration;

use shoal_core::{PartitionId, TopicId};
use shoal_segment::SegmentConfig;

/// Default timeout for replicating and applying a command.
pub const REPLICATION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Retry behaviour of the background eviction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Delay before the first retry of a gated or failed eviction.
    pub backoff_initial: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// How long an eviction may stay blocked before a warning is logged.
    /// The warning repeats at this interval; the eviction is never dropped.
    pub stall_warning_after: Duration,
}

impl EvictionConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            stall_warning_after: Duration::from_secs(60),
        }
    }

    /// Short delays for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(20),
            stall_warning_after: Duration::from_millis(500),
        }
    }

    /// Sets the initial retry delay.
    #[must_use]
    pub const fn with_backoff_initial(mut self, delay: Duration) -> Self {
        self.backoff_initial = delay;
        self
    }

    /// Sets the maximum retry delay.
    #[must_use]
    pub const fn with_backoff_max(mut self, delay: Duration) -> Self {
        self.backoff_max = delay;
        self
    }

    /// Sets the stall warning interval.
    #[must_use]
    pub const fn with_stall_warning_after(mut self, after: Duration) -> Self {
        self.stall_warning_after = after;
        self
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one partition log.
#[derive(Debug, Clone)]
pub struct PartitionLogConfig {
    /// Topic the partition belongs to.
    pub topic_id: TopicId,
    /// Partition index within the topic.
    pub partition_id: PartitionId,
    /// Directory holding the partition's segments and state.
    pub dir: PathBuf,
    /// Segment roll thresholds.
    pub segment: SegmentConfig,
    /// Eviction retry behaviour.
    pub eviction: EvictionConfig,
    /// Default bound on replicating and applying a command.
    pub replication_timeout: Duration,
    /// Delay before retrying a committed append that storage rejected.
    pub append_retry_initial: Duration,
    /// Upper bound on the append retry delay.
    pub append_retry_max: Duration,
}

impl PartitionLogConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(topic_id: TopicId, partition_id: PartitionId, dir: impl Into<PathBuf>) -> Self {
        Self {
            topic_id,
            partition_id,
            dir: dir.into(),
            segment: SegmentConfig::new(),
            eviction: EvictionConfig::new(),
            replication_timeout: REPLICATION_TIMEOUT_DEFAULT,
            append_retry_initial: Duration::from_millis(10),
            append_retry_max: Duration::from_secs(1),
        }
    }

    /// Small segments and short delays for tests.
    #[must_use]
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            segment: SegmentConfig::for_testing(),
            eviction: EvictionConfig::for_testing(),
            replication_timeout: Duration::from_secs(2),
            append_retry_initial: Duration::from_millis(1),
            append_retry_max: Duration::from_millis(20),
            ..Self::new(TopicId::new(1), PartitionId::new(0), dir)
        }
    }

    /// Sets the segment configuration.
    #[must_use]
    pub fn with_segment(mut self, segment: SegmentConfig) -> Self {
        self.segment = segment;
        self
    }

    /// Sets the eviction configuration.
    #[must_use]
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Sets the replication timeout.
    #[must_use]
    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    /// Sets the retry delays for committed appends that fail to apply.
    #[must_use]
    pub fn with_append_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.append_retry_initial = initial;
        self.append_retry_max = max;
        self
    }
}
