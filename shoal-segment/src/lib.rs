//! Shoal Segment - on-disk segments of a partition log.
//!
//! A partition's records live in a sequence of segment files. The newest
//! segment is active and takes appends; older segments are sealed and are
//! only ever removed whole, oldest first, when the partition's start offset
//! moves past them.
//!
//! # Design Principles
//!
//! - **Checksums**: CRC32 on every batch and on the manifest
//! - **Manifest last**: the manifest commit is the final step of every roll
//!   and every removal, and recovery reconciles files against it
//! - **Idempotent removal**: removing a segment that is already gone is a
//!   no-op
//! - **Pluggable storage**: a tokio-backed implementation for production and
//!   an in-memory one with fault injection for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batch;
mod error;
mod manifest;
mod segment;
mod store;
pub mod storage;

pub use batch::{BatchHeader, RecordBatch, BATCH_HEADER_SIZE};
pub use error::{SegmentError, SegmentResult};
pub use manifest::{Manifest, MANIFEST_FILE_NAME};
pub use segment::{Segment, SegmentInfo, SEGMENT_EXTENSION};
pub use storage::{
    write_atomic, SimulatedStorage, Storage, StorageFaultConfig, StorageFile, TokioStorage,
};
pub use store::{SegmentConfig, SegmentStore};

/// Segment limits.
pub mod limits {
    /// Maximum size of the records in one batch (16 MB).
    pub const BATCH_PAYLOAD_BYTES_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum number of records in one batch.
    pub const BATCH_RECORDS_MAX: u32 = 1_000_000;

    /// Maximum configurable segment size (1 GB).
    pub const SEGMENT_SIZE_BYTES_MAX: u64 = 1024 * 1024 * 1024;

    /// Maximum number of live segments in one partition.
    pub const SEGMENTS_PER_PARTITION_MAX: u32 = 1_000_000;
}
