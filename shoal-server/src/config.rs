//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use shoal_core::NodeId;
use shoal_partition::{EvictionConfig, REPLICATION_TIMEOUT_DEFAULT};
use shoal_segment::SegmentConfig;

/// Configuration for a Shoal server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Root directory; each partition lives in `<data_dir>/<topic>/<index>`.
    pub data_dir: PathBuf,
    /// Timeout for a request that does not carry its own.
    pub request_timeout: Duration,
    /// Segment roll thresholds for every partition.
    pub segment: SegmentConfig,
    /// Eviction retry behaviour for every partition.
    pub eviction: EvictionConfig,
}

impl ServerConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            request_timeout: REPLICATION_TIMEOUT_DEFAULT,
            segment: SegmentConfig::new(),
            eviction: EvictionConfig::new(),
        }
    }

    /// Small segments and short delays for tests.
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            segment: SegmentConfig::for_testing(),
            eviction: EvictionConfig::for_testing(),
            ..Self::new(NodeId::new(1), data_dir)
        }
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
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
}
