//! Shoal Server - delete-records handling over a registry of partitions.
//!
//! This crate hosts topics made of [`PartitionLog`](shoal_partition::PartitionLog)s
//! and answers delete-records requests: each `(topic, partition) -> offset`
//! pair moves that partition's start offset forward.
//!
//! # Error codes
//!
//! | Condition | Code |
//! |---|---|
//! | Accepted | `OK` |
//! | `offset <= start` or `offset > high watermark` | `OFFSET_OUT_OF_RANGE` |
//! | Unknown topic or partition index | `UNKNOWN_TOPIC_OR_PARTITION` |
//! | Leadership lost or partition shutting down | `NOT_LEADER_OR_FOLLOWER` |
//! | Not applied in time | `REQUEST_TIMED_OUT` |
//! | Anything else | `UNKNOWN_SERVER_ERROR` |
//!
//! Every failed pair reports a low watermark of `-1`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod handler;
mod messages;
mod registry;

pub use config::ServerConfig;
pub use error::{ErrorCode, ServerError, ServerResult};
pub use handler::DeleteRecordsHandler;
pub use messages::{
    DeleteRecordsPartition, DeleteRecordsPartitionResult, DeleteRecordsRequest,
    DeleteRecordsResponse, DeleteRecordsTopic, DeleteRecordsTopicResult, HIGH_WATERMARK_OFFSET,
    LOW_WATERMARK_UNKNOWN,
};
pub use registry::{TopicPartition, TopicRegistry};

/// Server limits.
pub mod limits {
    /// Maximum partitions in one topic.
    pub const PARTITIONS_PER_TOPIC_MAX: u32 = 10_000;

    /// Maximum topic name length.
    pub const TOPIC_NAME_LENGTH_MAX: usize = 249;
}
