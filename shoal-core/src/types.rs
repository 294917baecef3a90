//! Strongly-typed identifiers.
//!
//! Every identifier wraps a `u64` so that mixing up a node with a partition
//! is a compile error rather than a production incident.

use std::fmt;

/// Generates a `u64` newtype identifier with `Debug`/`Display` prefixes.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates an identifier from its raw value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the identifier that follows this one.
            ///
            /// # Panics
            /// Panics on overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Identifier of a broker node (a replica host).");
define_id!(TopicId, "topic", "Identifier of a topic.");
define_id!(PartitionId, "partition", "Index of a partition within its topic.");
define_id!(TermId, "term", "Replication term; doubles as the leader epoch.");
define_id!(LogIndex, "idx", "Position of a command in the replicated command log.");
define_id!(ProducerId, "producer", "Identifier of a transactional producer.");
