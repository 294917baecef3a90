//! Segment store error types.

use thiserror::Error;

/// Result type for segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;

/// Errors raised by segment files, the manifest and the segment store.
#[derive(Debug, Clone, Error)]
pub enum SegmentError {
    /// I/O error from the storage backend.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// Operation being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// A batch checksum did not match its contents.
    #[error("checksum mismatch at position {position}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte position of the batch within its segment file.
        position: u64,
        /// CRC32 stored in the header.
        expected: u32,
        /// CRC32 computed over the payload.
        actual: u32,
    },

    /// A batch header or payload could not be decoded.
    #[error("invalid batch at position {position}: {reason}")]
    InvalidBatch {
        /// Byte position of the batch within its segment file.
        position: u64,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// The manifest exists but cannot be trusted.
    #[error("manifest corrupt: {reason}")]
    ManifestCorrupt {
        /// Why the manifest was rejected.
        reason: &'static str,
    },

    /// A batch exceeds the segment size limit.
    #[error("batch too large: {size} bytes exceeds max {max} bytes")]
    BatchTooLarge {
        /// Encoded size.
        size: u64,
        /// Maximum allowed.
        max: u64,
    },

    /// The active segment cannot be removed.
    #[error("segment at base offset {base_offset} is the active segment")]
    ActiveSegment {
        /// Base offset of the active segment.
        base_offset: u64,
    },
}

impl SegmentError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if repeating the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns true if the error indicates corrupt persisted data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidBatch { .. } | Self::ManifestCorrupt { .. }
        )
    }
}
