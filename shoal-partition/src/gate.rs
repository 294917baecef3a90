//! Transaction gate.
//!
//! Tracks the first offset written by every open transaction. Physical
//! eviction may only delete data below [`TransactionGate::max_collectible_offset`].
//! The gate is driven by transaction begin and end events; eviction only
//! reads it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use shoal_core::{Offset, ProducerId};
use tracing::debug;

use crate::watermark::WatermarkTracker;

/// Open transactions of one partition.
#[derive(Debug)]
pub struct TransactionGate {
    watermarks: Arc<WatermarkTracker>,
    /// Producer -> first offset written in its open transaction.
    open: Mutex<BTreeMap<ProducerId, Offset>>,
}

impl TransactionGate {
    /// Creates a gate with no open transactions.
    #[must_use]
    pub fn new(watermarks: Arc<WatermarkTracker>) -> Self {
        Self {
            watermarks,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    fn open(&self) -> std::sync::MutexGuard<'_, BTreeMap<ProducerId, Offset>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a transactional write at `first_offset`.
    ///
    /// A producer that already has an open transaction keeps its earlier
    /// first offset.
    pub fn begin(&self, producer: ProducerId, first_offset: Offset) {
        let mut open = self.open();
        let entry = open.entry(producer).or_insert(first_offset);
        if first_offset < *entry {
            *entry = first_offset;
        }
        debug!(
            producer = %producer,
            first_offset = entry.get(),
            open = open.len(),
            "Transaction open"
        );
    }

    /// Closes the producer's transaction, by commit or abort. Returns the
    /// first offset it held, or `None` if it had none open.
    pub fn end(&self, producer: ProducerId) -> Option<Offset> {
        let mut open = self.open();
        let first = open.remove(&producer);
        debug!(producer = %producer, open = open.len(), "Transaction closed");
        first
    }

    /// Lowest first offset of any open transaction.
    #[must_use]
    pub fn lowest_open_offset(&self) -> Option<Offset> {
        self.open().values().min().copied()
    }

    /// Highest offset below which no record belongs to an open transaction.
    ///
    /// Equals the high watermark when no transaction is open.
    #[must_use]
    pub fn max_collectible_offset(&self) -> Offset {
        let high_watermark = self.watermarks.high_watermark();
        self.lowest_open_offset()
            .map_or(high_watermark, |lowest| lowest.min(high_watermark))
    }

    /// Offset below which every transaction is decided.
    ///
    /// Readers honouring isolation stop here.
    #[must_use]
    pub fn last_stable_offset(&self) -> Offset {
        self.max_collectible_offset()
    }

    /// Number of open transactions.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.open().len()
    }
}
