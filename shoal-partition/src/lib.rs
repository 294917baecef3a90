//! Shoal Partition - a replicated partition log with prefix truncation.
//!
//! A partition is an append-only log whose mutations are commands ordered by
//! a replication layer. This crate applies those commands and owns the
//! partition's watermarks, open transactions and segment store.
//!
//! # Design
//!
//! A partition consists of:
//! - A [`SegmentStore`](shoal_segment::SegmentStore) holding the records
//! - A [`WatermarkTracker`] for the start offset and high watermark
//! - A [`TransactionGate`] tracking where open transactions begin
//! - An [`EvictionStateMachine`] that applies truncation commands and a
//!   background [`EvictionWorker`] that deletes segments once safe
//!
//! # Operations
//!
//! - `append`: add records to the end of the log
//! - `read`: fetch records between the start offset and the high watermark
//! - `request_truncate`: move the start offset forward
//!
//! # Principles
//!
//! - The replicated command log is the source of truth; on-disk state is
//!   reconciled against it on restart
//! - Readers consult watermarks, never segment presence
//! - No unsafe code

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod config;
mod error;
mod eviction;
mod gate;
mod partition;
mod replicator;
mod state;
mod watermark;

pub use command::PartitionCommand;
pub use config::{EvictionConfig, PartitionLogConfig, REPLICATION_TIMEOUT_DEFAULT};
pub use error::{PartitionError, PartitionResult, ReplicationError, ReplicationResult};
pub use eviction::{EvictionRequest, EvictionStateMachine, EvictionWorker};
pub use gate::TransactionGate;
pub use partition::{PartitionLog, PartitionMetadata};
pub use replicator::{CommitStream, CommittedEntry, LocalReplicator, Replicator};
pub use state::{EvictionState, EvictionStateStore, EVICTION_STATE_FILE_NAME};
pub use watermark::{WatermarkTracker, Watermarks};

/// Partition limits.
pub mod limits {
    /// Maximum number of uncollected command outcomes kept per partition.
    ///
    /// Outcomes of entries nobody waits for (replayed or follower-applied)
    /// are dropped oldest first beyond this.
    pub const APPLY_OUTCOMES_MAX: usize = 4096;
}
