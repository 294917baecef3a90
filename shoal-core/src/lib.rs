//! Shoal Core - identifiers, offsets and records shared by every Shoal crate.
//!
//! Shoal is a replicated, partitioned, append-only log. This crate carries
//! only vocabulary: it does no I/O and owns no state.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `TopicId` can never be passed where a
//!   `PartitionId` is expected
//! - **Explicit widths**: offsets and indexes are `u64`, never `usize`
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod record;
mod types;

pub use record::{Offset, Record, RECORD_HEADER_SIZE};
pub use types::{LogIndex, NodeId, PartitionId, ProducerId, TermId, TopicId};
