//! Start offset and high watermark of a partition.
//!
//! Both counters only move forward. The start offset is advanced by the
//! eviction state machine, the high watermark by the append path; the
//! partition's apply loop is the only writer of either. Readers never take a
//! lock.

use std::sync::atomic::{AtomicU64, Ordering};

use shoal_core::Offset;

/// A consistent view of both watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Lowest readable offset (inclusive).
    pub start_offset: Offset,
    /// Offset the next committed record will receive (exclusive bound).
    pub high_watermark: Offset,
}

impl Watermarks {
    /// Returns true if `offset` is a readable record.
    #[must_use]
    pub fn contains(&self, offset: Offset) -> bool {
        offset >= self.start_offset && offset < self.high_watermark
    }
}

/// Lock-free watermark counters.
#[derive(Debug)]
pub struct WatermarkTracker {
    start_offset: AtomicU64,
    high_watermark: AtomicU64,
}

impl WatermarkTracker {
    /// Creates a tracker.
    ///
    /// # Panics
    /// Panics if `start_offset > high_watermark`.
    #[must_use]
    pub fn new(start_offset: Offset, high_watermark: Offset) -> Self {
        assert!(
            start_offset <= high_watermark,
            "start offset {start_offset} above high watermark {high_watermark}"
        );
        Self {
            start_offset: AtomicU64::new(start_offset.get()),
            high_watermark: AtomicU64::new(high_watermark.get()),
        }
    }

    /// Current start offset.
    #[must_use]
    pub fn start_offset(&self) -> Offset {
        Offset::new(self.start_offset.load(Ordering::Acquire))
    }

    /// Current high watermark.
    #[must_use]
    pub fn high_watermark(&self) -> Offset {
        Offset::new(self.high_watermark.load(Ordering::Acquire))
    }

    /// Reads both watermarks as of one instant.
    #[must_use]
    pub fn snapshot(&self) -> Watermarks {
        loop {
            let start = self.start_offset.load(Ordering::Acquire);
            let high = self.high_watermark.load(Ordering::Acquire);
            // The high watermark never moves back, so an unchanged start
            // offset means the pair held together at the second load.
            if self.start_offset.load(Ordering::Acquire) == start {
                return Watermarks {
                    start_offset: Offset::new(start),
                    high_watermark: Offset::new(high),
                };
            }
        }
    }

    /// Advances the start offset. Returns false if `new_value` is not ahead
    /// of the current value.
    pub fn advance_start_offset(&self, new_value: Offset) -> bool {
        debug_assert!(
            new_value <= self.high_watermark(),
            "start offset would pass the high watermark"
        );
        self.start_offset.fetch_max(new_value.get(), Ordering::AcqRel) < new_value.get()
    }

    /// Advances the high watermark. Returns false if `new_value` is not ahead
    /// of the current value.
    pub fn advance_high_watermark(&self, new_value: Offset) -> bool {
        self.high_watermark.fetch_max(new_value.get(), Ordering::AcqRel) < new_value.get()
    }
}
