//! Eviction state machine.
//!
//! Prefix truncation happens in two steps:
//!
//! 1. **Logical**: a committed `PrefixTruncate` command is applied in log
//!    order. The new start offset is persisted as pending work and then
//!    published through the [`WatermarkTracker`]; from that instant no read
//!    can return a record below it.
//! 2. **Physical**: the [`EvictionWorker`] removes sealed segments wholly
//!    below the truncation offset, but only once the [`TransactionGate`]
//!    reports that no open transaction holds data below it. A gated or failed
//!    attempt is retried with backoff and never dropped.
//!
//! ```text
//!  apply loop                         eviction worker
//!  ──────────                         ───────────────
//!  PrefixTruncate(r)
//!    validate r in (start, hwm]
//!    persist {last=r, pending=r}
//!    start := r  ──── EvictionRequest(r) ───►  wait max_collectible >= r
//!                                              remove segments below r
//!                                              persist {pending=None}
//! ```
//!
//! After a restart, [`EvictionStateMachine::recover`] reschedules the
//! persisted pending offset and sweeps sealed segments left below the start
//! offset.

use std::sync::Arc;

use shoal_core::{LogIndex, Offset, PartitionId, TopicId};
use shoal_segment::SegmentStore;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EvictionConfig;
use crate::error::{PartitionError, PartitionResult};
use crate::gate::TransactionGate;
use crate::state::EvictionStateStore;
use crate::watermark::WatermarkTracker;

/// Physical eviction work for one truncation offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionRequest {
    /// Segments wholly below this offset are removed.
    pub offset: Offset,
}

/// Applies truncation commands and schedules physical eviction.
#[derive(Debug)]
pub struct EvictionStateMachine {
    topic_id: TopicId,
    partition_id: PartitionId,
    watermarks: Arc<WatermarkTracker>,
    store: Arc<RwLock<SegmentStore>>,
    state: Arc<EvictionStateStore>,
    queue: mpsc::UnboundedSender<EvictionRequest>,
}

impl EvictionStateMachine {
    /// Creates the state machine and the worker that performs its evictions.
    #[must_use]
    pub fn new(
        topic_id: TopicId,
        partition_id: PartitionId,
        watermarks: Arc<WatermarkTracker>,
        gate: Arc<TransactionGate>,
        store: Arc<RwLock<SegmentStore>>,
        state: Arc<EvictionStateStore>,
        config: EvictionConfig,
    ) -> (Self, EvictionWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = EvictionWorker {
            topic_id,
            partition_id,
            gate,
            store: Arc::clone(&store),
            state: Arc::clone(&state),
            queue: rx,
            config,
        };
        let machine = Self {
            topic_id,
            partition_id,
            watermarks,
            store,
            state,
            queue: tx,
        };
        (machine, worker)
    }

    /// Checks `requested` against the current watermarks.
    ///
    /// Valid targets lie in `(start_offset, high_watermark]`: truncating to
    /// the current start is rejected, truncating to the high watermark
    /// empties the partition.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` otherwise.
    pub fn validate(&self, requested: Offset) -> PartitionResult<()> {
        let watermarks = self.watermarks.snapshot();
        if requested <= watermarks.start_offset || requested > watermarks.high_watermark {
            return Err(PartitionError::out_of_range(
                requested.get(),
                watermarks.start_offset.get(),
                watermarks.high_watermark.get(),
            ));
        }
        Ok(())
    }

    /// Applies a committed truncation command at `index`.
    ///
    /// Re-delivery of an already applied command returns the current start
    /// offset and changes nothing. A command that went stale between
    /// submission and commit is rejected without side effects.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` for a stale command.
    pub async fn apply_committed(
        &self,
        index: LogIndex,
        requested: Offset,
    ) -> PartitionResult<Offset> {
        let state = self.state.current();
        if index <= state.last_applied_index {
            debug!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                index = index.get(),
                "Truncation already applied"
            );
            return Ok(self.watermarks.start_offset());
        }

        if let Err(e) = self.validate(requested) {
            debug!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                index = index.get(),
                requested = requested.get(),
                error = %e,
                "Rejected stale truncation"
            );
            return Err(e);
        }

        let persisted = self
            .state
            .update(|s| {
                s.last_applied_truncation_offset = requested;
                s.last_applied_index = index;
                s.pending_offset = Some(s.pending_offset.map_or(requested, |p| p.max(requested)));
            })
            .await;
        if let Err(e) = persisted {
            // The command log still carries the truncation; replay restores it.
            warn!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                error = %e,
                "Failed to persist eviction state"
            );
        }

        self.watermarks.advance_start_offset(requested);
        info!(
            topic = %self.topic_id,
            partition = %self.partition_id,
            index = index.get(),
            start_offset = requested.get(),
            "Applied prefix truncation"
        );
        self.schedule(requested);
        Ok(requested)
    }

    /// Reschedules eviction work left over from before a restart.
    ///
    /// Call once the replayed command log has been applied, so the
    /// transaction gate reflects every open transaction.
    pub async fn recover(&self) {
        let state = self.state.current();
        let start_offset = self.watermarks.start_offset();

        if let Some(pending) = state.pending_offset {
            info!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                pending = pending.get(),
                "Resuming pending eviction"
            );
            self.schedule(pending);
        }

        let orphans = self.store.read().await.segments_below(start_offset);
        let covered = state.pending_offset.is_some_and(|p| p >= start_offset);
        if !orphans.is_empty() && !covered {
            info!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                segments = orphans.len(),
                start_offset = start_offset.get(),
                "Sweeping segments below start offset"
            );
            self.schedule(start_offset);
        }
    }

    /// Offset of a truncation applied logically but not yet physically.
    #[must_use]
    pub fn pending_offset(&self) -> Option<Offset> {
        self.state.current().pending_offset
    }

    fn schedule(&self, offset: Offset) {
        if self.queue.send(EvictionRequest { offset }).is_err() {
            // Worker gone: the partition is shutting down. The pending
            // offset is persisted and picked up by the next recovery.
            debug!(
                topic = %self.topic_id,
                partition = %self.partition_id,
                offset = offset.get(),
                "Eviction worker stopped, request deferred"
            );
        }
    }
}

/// Background task that performs physical evictions one at a time.
#[derive(Debug)]
pub struct EvictionWorker {
    topic_id: TopicId,
    partition_id: PartitionId,
    gate: Arc<TransactionGate>,
    store: Arc<RwLock<SegmentStore>>,
    state: Arc<EvictionStateStore>,
    queue: mpsc::UnboundedReceiver<EvictionRequest>,
    config: EvictionConfig,
}

impl EvictionWorker {
    /// Processes requests until shutdown or until the state machine is
    /// dropped.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(
                        topic = %self.topic_id,
                        partition = %self.partition_id,
                        "Eviction worker shutting down"
                    );
                    break;
                }
                request = self.queue.recv() => {
                    let Some(request) = request else { break };
                    if !self.evict(request, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }
    }

    /// Drives one request to completion. Returns false on shutdown.
    async fn evict(
        &self,
        request: EvictionRequest,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        let started = Instant::now();
        let mut next_warning = started + self.config.stall_warning_after;
        let mut backoff = self.config.backoff_initial;

        loop {
            let collectible = self.gate.max_collectible_offset();
            if collectible >= request.offset {
                match self.remove_below(request.offset).await {
                    Ok(removed) => {
                        info!(
                            topic = %self.topic_id,
                            partition = %self.partition_id,
                            offset = request.offset.get(),
                            removed,
                            elapsed_ms = elapsed_ms(started),
                            "Eviction completed"
                        );
                        return true;
                    }
                    Err(e) => warn!(
                        topic = %self.topic_id,
                        partition = %self.partition_id,
                        offset = request.offset.get(),
                        error = %e,
                        "Eviction failed, retrying"
                    ),
                }
            } else {
                debug!(
                    topic = %self.topic_id,
                    partition = %self.partition_id,
                    offset = request.offset.get(),
                    max_collectible = collectible.get(),
                    "Eviction gated by open transaction"
                );
            }

            let now = Instant::now();
            if now >= next_warning {
                warn!(
                    topic = %self.topic_id,
                    partition = %self.partition_id,
                    offset = request.offset.get(),
                    max_collectible = collectible.get(),
                    open_transactions = self.gate.open_transactions(),
                    stalled_ms = elapsed_ms(started),
                    "Eviction stalled"
                );
                next_warning = now + self.config.stall_warning_after;
            }

            // No lock is held while waiting.
            tokio::select! {
                _ = shutdown_rx.recv() => return false,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.backoff_max);
        }
    }

    async fn remove_below(&self, offset: Offset) -> PartitionResult<usize> {
        let removed = {
            let mut store = self.store.write().await;
            let below = store.segments_below(offset);
            if below.is_empty() {
                0
            } else {
                store.remove(&below).await?
            }
        };
        self.state
            .update(|s| {
                if s.pending_offset.is_some_and(|p| p <= offset) {
                    s.pending_offset = None;
                }
            })
            .await?;
        Ok(removed)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
