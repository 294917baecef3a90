//! Partition log.
//!
//! A [`PartitionLog`] owns one partition's segment store, watermarks,
//! transaction gate and eviction state machine. Every mutation is a
//! [`PartitionCommand`] replicated through the [`Replicator`]; a single apply
//! task consumes the commit stream in index order, so the state of every
//! replica is a function of the command log alone.
//!
//! Submitters learn the result of their command by log index: the apply task
//! records each outcome and then publishes the applied index, and the
//! submitter waits for its index to be published before taking the outcome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use shoal_core::{LogIndex, NodeId, Offset, PartitionId, ProducerId, Record, TermId, TopicId};
use shoal_segment::{SegmentStore, Storage};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::PartitionCommand;
use crate::config::PartitionLogConfig;
use crate::error::{PartitionError, PartitionResult};
use crate::eviction::EvictionStateMachine;
use crate::gate::TransactionGate;
use crate::limits::APPLY_OUTCOMES_MAX;
use crate::replicator::{CommitStream, CommittedEntry, Replicator};
use crate::state::EvictionStateStore;
use crate::watermark::{WatermarkTracker, Watermarks};

/// Point-in-time description of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    /// Topic the partition belongs to.
    pub topic_id: TopicId,
    /// Partition index within the topic.
    pub partition_id: PartitionId,
    /// Lowest readable offset.
    pub start_offset: Offset,
    /// Offset the next record will receive.
    pub high_watermark: Offset,
    /// Offset below which every transaction is decided.
    pub last_stable_offset: Offset,
    /// Current leader, if known.
    pub leader: Option<NodeId>,
    /// Current leader epoch.
    pub leader_epoch: TermId,
    /// Live segments, including the active one.
    pub segment_count: usize,
    /// Bytes on disk across all segments.
    pub size_bytes: u64,
    /// Truncation applied logically but not yet physically.
    pub pending_eviction: Option<Offset>,
}

/// State shared between the partition handle and its apply task.
#[derive(Debug)]
struct Shared {
    topic_id: TopicId,
    partition_id: PartitionId,
    watermarks: Arc<WatermarkTracker>,
    gate: Arc<TransactionGate>,
    store: Arc<RwLock<SegmentStore>>,
    state: Arc<EvictionStateStore>,
    eviction: EvictionStateMachine,
    /// Outcomes of applied commands not yet collected by their submitter.
    outcomes: Mutex<BTreeMap<LogIndex, PartitionResult<Offset>>>,
    applied: watch::Sender<LogIndex>,
}

impl Shared {
    fn record_outcome(&self, index: LogIndex, outcome: PartitionResult<Offset>) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        outcomes.insert(index, outcome);
        // Replayed and follower-applied entries have no submitter waiting.
        while outcomes.len() > APPLY_OUTCOMES_MAX {
            outcomes.pop_first();
        }
    }

    fn take_outcome(&self, index: LogIndex) -> Option<PartitionResult<Offset>> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index)
    }
}

struct BackgroundTasks {
    apply_shutdown: mpsc::Sender<()>,
    apply: JoinHandle<()>,
    eviction_shutdown: mpsc::Sender<()>,
    eviction: JoinHandle<()>,
}

/// One replica of a partition.
pub struct PartitionLog {
    shared: Arc<Shared>,
    replicator: Arc<dyn Replicator>,
    replication_timeout: Duration,
    closed: AtomicBool,
    tasks: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for PartitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLog")
            .field("topic_id", &self.shared.topic_id)
            .field("partition_id", &self.shared.partition_id)
            .field("watermarks", &self.shared.watermarks.snapshot())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PartitionLog {
    /// Opens (or creates) the partition under `config.dir`.
    ///
    /// `commits` must deliver the command log from its first entry; entries
    /// already reflected on disk are recognized by index and not applied
    /// twice. Pending evictions are resumed once the entries committed at
    /// open time have been applied.
    ///
    /// # Errors
    /// Returns an error if the segment store or eviction state cannot be
    /// recovered, or if the store holds entries the command log does not.
    pub async fn open(
        config: PartitionLogConfig,
        storage: Arc<dyn Storage>,
        replicator: Arc<dyn Replicator>,
        commits: CommitStream,
    ) -> PartitionResult<Self> {
        let store = SegmentStore::open(Arc::clone(&storage), &config.dir, config.segment).await?;
        let state = EvictionStateStore::load(storage, &config.dir).await?;
        let persisted = state.current();

        let durable_index = store.last_log_index();
        let committed = replicator.last_committed();
        if durable_index > committed {
            error!(
                topic = %config.topic_id,
                partition = %config.partition_id,
                durable_index = ?durable_index,
                committed = ?committed,
                "Segment store is ahead of the command log"
            );
            return Err(PartitionError::CorruptState {
                reason: "segment store holds entries the command log does not",
            });
        }

        let start_offset = persisted
            .last_applied_truncation_offset
            .max(store.first_offset());
        let high_watermark = store.log_end_offset();
        if start_offset > high_watermark {
            error!(
                topic = %config.topic_id,
                partition = %config.partition_id,
                start_offset = start_offset.get(),
                high_watermark = high_watermark.get(),
                "Persisted start offset beyond log end"
            );
            return Err(PartitionError::CorruptState {
                reason: "start offset beyond log end",
            });
        }

        let replay_floor = durable_index.max(Some(persisted.last_applied_index));
        let segment_count = store.segment_count();

        let watermarks = Arc::new(WatermarkTracker::new(start_offset, high_watermark));
        let gate = Arc::new(TransactionGate::new(Arc::clone(&watermarks)));
        let store = Arc::new(RwLock::new(store));
        let state = Arc::new(state);
        let (eviction, worker) = EvictionStateMachine::new(
            config.topic_id,
            config.partition_id,
            Arc::clone(&watermarks),
            Arc::clone(&gate),
            Arc::clone(&store),
            Arc::clone(&state),
            config.eviction,
        );
        let (applied, _) = watch::channel(LogIndex::new(0));

        let shared = Arc::new(Shared {
            topic_id: config.topic_id,
            partition_id: config.partition_id,
            watermarks,
            gate,
            store,
            state,
            eviction,
            outcomes: Mutex::new(BTreeMap::new()),
            applied,
        });

        let (eviction_shutdown, eviction_shutdown_rx) = mpsc::channel(1);
        let eviction = tokio::spawn(worker.run(eviction_shutdown_rx));

        let apply_loop = ApplyLoop {
            shared: Arc::clone(&shared),
            replay_floor,
            recover_at: committed,
            recovered: false,
            retry_initial: config.append_retry_initial,
            retry_max: config.append_retry_max,
        };
        let (apply_shutdown, apply_shutdown_rx) = mpsc::channel(1);
        let apply = tokio::spawn(apply_loop.run(commits, apply_shutdown_rx));

        info!(
            topic = %config.topic_id,
            partition = %config.partition_id,
            start_offset = start_offset.get(),
            high_watermark = high_watermark.get(),
            segments = segment_count,
            replay_floor = ?replay_floor,
            "Opened partition log"
        );

        Ok(Self {
            shared,
            replicator,
            replication_timeout: config.replication_timeout,
            closed: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Some(BackgroundTasks {
                apply_shutdown,
                apply,
                eviction_shutdown,
                eviction,
            })),
        })
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends records and returns the offset of the first one.
    ///
    /// # Errors
    /// Returns `EmptyAppend`, `NotLeader`, `Timeout` or a storage error.
    pub async fn append(&self, records: Vec<Record>) -> PartitionResult<Offset> {
        if records.is_empty() {
            return Err(PartitionError::EmptyAppend);
        }
        let command = PartitionCommand::Append {
            producer: None,
            records,
        };
        self.submit(&command, self.replication_timeout).await
    }

    /// Appends records inside `producer`'s transaction, opening it on the
    /// first write.
    ///
    /// # Errors
    /// Same as [`append`](Self::append).
    pub async fn append_transactional(
        &self,
        producer: ProducerId,
        records: Vec<Record>,
    ) -> PartitionResult<Offset> {
        if records.is_empty() {
            return Err(PartitionError::EmptyAppend);
        }
        let command = PartitionCommand::Append {
            producer: Some(producer),
            records,
        };
        self.submit(&command, self.replication_timeout).await
    }

    /// Commits or aborts `producer`'s open transaction.
    ///
    /// Control markers do not occupy offsets; the high watermark is returned.
    ///
    /// # Errors
    /// Returns `NotLeader` or `Timeout`.
    pub async fn end_transaction(
        &self,
        producer: ProducerId,
        commit: bool,
    ) -> PartitionResult<Offset> {
        let command = PartitionCommand::EndTransaction { producer, commit };
        self.submit(&command, self.replication_timeout).await
    }

    /// Moves the start offset forward to `offset`.
    ///
    /// Returns the new start offset once the truncation is committed and
    /// applied. Segments below it are removed in the background, after every
    /// transaction holding data there has ended.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` unless `start_offset < offset <=
    /// high_watermark`, `NotLeader` if this replica does not lead, and
    /// `Timeout` if the command was not applied within `timeout`. A timeout
    /// after the command committed does not undo it.
    pub async fn request_truncate(
        &self,
        offset: Offset,
        timeout: Duration,
    ) -> PartitionResult<Offset> {
        self.ensure_open()?;
        self.ensure_leader()?;
        self.shared.eviction.validate(offset)?;
        debug!(
            topic = %self.shared.topic_id,
            partition = %self.shared.partition_id,
            offset = offset.get(),
            "Submitting prefix truncation"
        );
        self.submit(&PartitionCommand::PrefixTruncate { offset }, timeout)
            .await
    }

    /// Returns the start offset as of a barrier committed after every
    /// command accepted so far.
    ///
    /// # Errors
    /// Returns `NotLeader` or `Timeout`.
    pub async fn sync_effective_start(&self, timeout: Duration) -> PartitionResult<Offset> {
        self.submit(&PartitionCommand::Barrier, timeout).await
    }

    async fn submit(
        &self,
        command: &PartitionCommand,
        timeout: Duration,
    ) -> PartitionResult<Offset> {
        self.ensure_open()?;
        self.ensure_leader()?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut applied = self.shared.applied.subscribe();
        let index = self.replicator.replicate(command.encode(), timeout).await?;

        let waited = tokio::time::timeout_at(deadline, applied.wait_for(|a| *a >= index))
            .await
            .map(|applied| applied.is_ok());
        match waited {
            Ok(true) => {}
            Ok(false) => return Err(PartitionError::ShuttingDown),
            Err(_) => {
                debug!(
                    topic = %self.shared.topic_id,
                    partition = %self.shared.partition_id,
                    command = command.kind(),
                    index = index.get(),
                    "Committed command not applied in time"
                );
                return Err(PartitionError::Timeout {
                    operation: "apply",
                    waited_ms: elapsed_ms(started),
                });
            }
        }

        self.shared.take_outcome(index).unwrap_or_else(|| {
            Err(PartitionError::Internal {
                message: format!("outcome of index {index} was discarded"),
            })
        })
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Reads up to `max_records` records starting at `offset`.
    ///
    /// Bounds come from the watermarks, not from which segments exist:
    /// records below the start offset are never returned even if their
    /// segment has not been removed yet.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` if `offset` is below the start offset or
    /// above the high watermark.
    pub async fn read(&self, offset: Offset, max_records: usize) -> PartitionResult<Vec<Record>> {
        let bounds = self.validate_fetch_offset(offset)?;
        if offset == bounds.high_watermark || max_records == 0 {
            return Ok(Vec::new());
        }

        let mut records = {
            let store = self.shared.store.read().await;
            store.read(offset, max_records).await?
        };

        // A truncation applied during the read may have moved the start.
        let start_offset = self.shared.watermarks.start_offset();
        if offset < start_offset {
            return Err(PartitionError::out_of_range(
                offset.get(),
                start_offset.get(),
                bounds.high_watermark.get(),
            ));
        }
        records.retain(|r| r.offset >= offset && r.offset < bounds.high_watermark);
        Ok(records)
    }

    /// Checks that a fetch may start at `offset`, returning the bounds it
    /// was checked against.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` unless `start_offset <= offset <=
    /// high_watermark`.
    pub fn validate_fetch_offset(&self, offset: Offset) -> PartitionResult<Watermarks> {
        let bounds = self.shared.watermarks.snapshot();
        if offset < bounds.start_offset || offset > bounds.high_watermark {
            return Err(PartitionError::out_of_range(
                offset.get(),
                bounds.start_offset.get(),
                bounds.high_watermark.get(),
            ));
        }
        Ok(bounds)
    }

    /// Lowest readable offset.
    #[must_use]
    pub fn start_offset(&self) -> Offset {
        self.shared.watermarks.start_offset()
    }

    /// Offset the next record will receive.
    #[must_use]
    pub fn high_watermark(&self) -> Offset {
        self.shared.watermarks.high_watermark()
    }

    /// Both watermarks as of one instant.
    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        self.shared.watermarks.snapshot()
    }

    /// Offset below which every transaction is decided.
    #[must_use]
    pub fn last_stable_offset(&self) -> Offset {
        self.shared.gate.last_stable_offset()
    }

    /// Truncation applied logically but not yet physically.
    #[must_use]
    pub fn pending_eviction(&self) -> Option<Offset> {
        self.shared.eviction.pending_offset()
    }

    /// Returns true if this replica leads the partition.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.replicator.is_leader()
    }

    /// Current leader, if known.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.replicator.leader()
    }

    /// Current leader epoch.
    #[must_use]
    pub fn leader_epoch(&self) -> TermId {
        self.replicator.term()
    }

    /// Topic the partition belongs to.
    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        self.shared.topic_id
    }

    /// Partition index within the topic.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.shared.partition_id
    }

    /// Describes the partition.
    pub async fn metadata(&self) -> PartitionMetadata {
        let (segment_count, size_bytes) = {
            let store = self.shared.store.read().await;
            (store.segment_count(), store.size_bytes())
        };
        let watermarks = self.shared.watermarks.snapshot();
        PartitionMetadata {
            topic_id: self.shared.topic_id,
            partition_id: self.shared.partition_id,
            start_offset: watermarks.start_offset,
            high_watermark: watermarks.high_watermark,
            last_stable_offset: self.shared.gate.last_stable_offset(),
            leader: self.replicator.leader(),
            leader_epoch: self.replicator.term(),
            segment_count,
            size_bytes,
            pending_eviction: self.shared.eviction.pending_offset(),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stops the apply and eviction tasks. Pending evictions stay persisted
    /// and resume on the next open.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        // A send error means the task already exited.
        let _ = tasks.apply_shutdown.send(()).await;
        let _ = tasks.eviction_shutdown.send(()).await;
        for (name, handle) in [("apply", tasks.apply), ("eviction", tasks.eviction)] {
            if let Err(e) = handle.await {
                warn!(
                    topic = %self.shared.topic_id,
                    partition = %self.shared.partition_id,
                    task = name,
                    error = %e,
                    "Partition task ended abnormally"
                );
            }
        }
        info!(
            topic = %self.shared.topic_id,
            partition = %self.shared.partition_id,
            "Partition log shut down"
        );
    }

    /// Shuts down and deletes every file the partition owns, including
    /// segments awaiting eviction.
    ///
    /// # Errors
    /// Returns an error if a file cannot be removed.
    pub async fn destroy(&self) -> PartitionResult<()> {
        self.shutdown().await;
        self.shared.store.write().await.destroy().await?;
        self.shared.state.destroy().await?;
        info!(
            topic = %self.shared.topic_id,
            partition = %self.shared.partition_id,
            "Partition log destroyed"
        );
        Ok(())
    }

    fn ensure_open(&self) -> PartitionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PartitionError::ShuttingDown);
        }
        Ok(())
    }

    fn ensure_leader(&self) -> PartitionResult<()> {
        if !self.replicator.is_leader() {
            return Err(PartitionError::NotLeader {
                leader_hint: self.replicator.leader(),
            });
        }
        Ok(())
    }
}

impl Drop for PartitionLog {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.apply.abort();
            tasks.eviction.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Apply loop
// ----------------------------------------------------------------------------

struct ApplyLoop {
    shared: Arc<Shared>,
    /// Appends at or below this index are already in the segment store.
    replay_floor: Option<LogIndex>,
    /// Eviction recovery runs once this index is applied.
    recover_at: Option<LogIndex>,
    recovered: bool,
    retry_initial: Duration,
    retry_max: Duration,
}

impl ApplyLoop {
    async fn run(mut self, mut commits: CommitStream, mut shutdown_rx: mpsc::Receiver<()>) {
        if self.recover_at.is_none() {
            self.recover().await;
        }
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(
                        topic = %self.shared.topic_id,
                        partition = %self.shared.partition_id,
                        "Apply task shutting down"
                    );
                    break;
                }
                entry = commits.recv() => {
                    let Some(entry) = entry else { break };
                    if !self.apply_entry(entry, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }
    }

    async fn recover(&mut self) {
        self.recovered = true;
        self.shared.eviction.recover().await;
    }

    /// Applies one committed entry. Returns false if shutdown arrived before
    /// the entry could be applied; its index is then left unpublished.
    async fn apply_entry(
        &mut self,
        entry: CommittedEntry,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        let index = entry.index;
        if index <= *self.shared.applied.borrow() {
            return true;
        }

        let outcome = match PartitionCommand::decode(&entry.data) {
            Some(PartitionCommand::Append { producer, records })
                if Some(index) > self.replay_floor =>
            {
                let Some(outcome) = self.apply_append(index, producer, records, shutdown_rx).await
                else {
                    debug!(
                        topic = %self.shared.topic_id,
                        partition = %self.shared.partition_id,
                        index = index.get(),
                        "Apply task stopped with a committed append unapplied"
                    );
                    return false;
                };
                outcome
            }
            Some(command) => self.apply_command(index, command).await,
            None => {
                error!(
                    topic = %self.shared.topic_id,
                    partition = %self.shared.partition_id,
                    index = index.get(),
                    "Undecodable committed entry"
                );
                Err(PartitionError::Internal {
                    message: format!("undecodable command at index {index}"),
                })
            }
        };
        self.shared.record_outcome(index, outcome);
        self.shared.applied.send_replace(index);

        if !self.recovered && self.recover_at.is_some_and(|at| index >= at) {
            self.recover().await;
        }
        true
    }

    /// Writes a committed append, retrying storage failures until it lands.
    ///
    /// Offsets are assigned in commit order, so a committed append is never
    /// skipped. Returns `None` if shutdown is requested first; the entry is
    /// then applied by the next open's replay.
    async fn apply_append(
        &self,
        index: LogIndex,
        producer: Option<ProducerId>,
        records: Vec<Record>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> Option<PartitionResult<Offset>> {
        let shared = &self.shared;
        if records.is_empty() {
            return Some(Err(PartitionError::EmptyAppend));
        }

        let mut backoff = self.retry_initial;
        let mut attempts = 0u32;
        loop {
            let attempt = {
                let mut store = shared.store.write().await;
                match store.append(index, records.clone()).await {
                    Ok(base_offset) => {
                        // The gate must see the transaction before its
                        // records become visible below the high watermark.
                        if let Some(producer) = producer {
                            shared.gate.begin(producer, base_offset);
                        }
                        shared.watermarks.advance_high_watermark(store.log_end_offset());
                        Ok(base_offset)
                    }
                    Err(e) => Err(e),
                }
            };
            attempts += 1;

            match attempt {
                Ok(base_offset) => {
                    if attempts > 1 {
                        info!(
                            topic = %shared.topic_id,
                            partition = %shared.partition_id,
                            index = index.get(),
                            attempts,
                            "Applied committed append after retrying"
                        );
                    }
                    return Some(Ok(base_offset));
                }
                // Every replica rejects the same entry the same way.
                Err(e) if !e.is_transient() => {
                    error!(
                        topic = %shared.topic_id,
                        partition = %shared.partition_id,
                        index = index.get(),
                        error = %e,
                        "Committed append rejected"
                    );
                    return Some(Err(e.into()));
                }
                Err(e) => warn!(
                    topic = %shared.topic_id,
                    partition = %shared.partition_id,
                    index = index.get(),
                    attempts,
                    error = %e,
                    "Failed to apply committed append, retrying"
                ),
            }

            // The store lock is released while waiting.
            tokio::select! {
                _ = shutdown_rx.recv() => return None,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.retry_max);
        }
    }

    async fn apply_command(
        &self,
        index: LogIndex,
        command: PartitionCommand,
    ) -> PartitionResult<Offset> {
        let shared = &self.shared;
        match command {
            // Appends above the replay floor go through apply_append.
            PartitionCommand::Append { producer, .. } => {
                Ok(self.replay_append(index, producer).await)
            }
            PartitionCommand::PrefixTruncate { offset } => {
                shared.eviction.apply_committed(index, offset).await
            }
            PartitionCommand::EndTransaction { producer, commit } => {
                let first = shared.gate.end(producer);
                debug!(
                    topic = %shared.topic_id,
                    partition = %shared.partition_id,
                    producer = %producer,
                    commit,
                    first_offset = ?first,
                    "Transaction ended"
                );
                Ok(shared.watermarks.high_watermark())
            }
            PartitionCommand::Barrier => Ok(shared.watermarks.start_offset()),
        }
    }

    /// Re-delivery of an append already on disk: rebuild the gate only.
    async fn replay_append(&self, index: LogIndex, producer: Option<ProducerId>) -> Offset {
        let shared = &self.shared;
        let base_offset = shared.store.read().await.base_offset_of(index);
        if let Some(producer) = producer {
            // A batch no longer on disk lay below the start offset.
            let first = base_offset.unwrap_or_else(|| shared.watermarks.start_offset());
            shared.gate.begin(producer, first);
        }
        base_offset.unwrap_or_else(|| shared.watermarks.start_offset())
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionLogConfig;
    use crate::replicator::LocalReplicator;
    use shoal_segment::{SegmentConfig, SimulatedStorage};

    async fn open(storage: &SimulatedStorage) -> (Arc<LocalReplicator>, PartitionLog) {
        let (replicator, commits) = LocalReplicator::new(NodeId::new(1));
        let config = PartitionLogConfig::for_testing("/t/0")
            .with_segment(SegmentConfig::for_testing().with_max_segment_records(10));
        let log = PartitionLog::open(
            config,
            Arc::new(storage.clone()),
            Arc::clone(&replicator) as Arc<dyn Replicator>,
            commits,
        )
        .await
        .unwrap();
        (replicator, log)
    }

    fn records(count: usize) -> Vec<Record> {
        (0..count).map(|i| Record::new(format!("r{i}"))).collect()
    }

    #[tokio::test]
    async fn test_append_advances_high_watermark() {
        let (_, log) = open(&SimulatedStorage::new()).await;
        assert_eq!(log.append(records(3)).await.unwrap(), Offset::new(0));
        assert_eq!(log.append(records(2)).await.unwrap(), Offset::new(3));
        assert_eq!(log.high_watermark(), Offset::new(5));
        assert_eq!(log.start_offset(), Offset::new(0));

        let read = log.read(Offset::new(2), 10).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].offset, Offset::new(2));
        assert!(log.read(Offset::new(5), 10).await.unwrap().is_empty());
        assert!(log.read(Offset::new(6), 10).await.is_err());
        assert!(matches!(
            log.append(Vec::new()).await,
            Err(PartitionError::EmptyAppend)
        ));
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_in_place() {
        let storage = SimulatedStorage::new();
        let (_, log) = open(&storage).await;
        log.append(vec![Record::new("a")]).await.unwrap();

        storage.fault_config().force_write_fail = true;
        assert_eq!(log.append(vec![Record::new("b")]).await.unwrap(), Offset::new(1));
        assert_eq!(log.append(vec![Record::new("c")]).await.unwrap(), Offset::new(2));

        let read = log.read(Offset::new(0), 10).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[1].value, "b");
        assert_eq!(read[2].value, "c");
    }

    #[tokio::test]
    async fn test_truncate_hides_records_below_start() {
        let (_, log) = open(&SimulatedStorage::new()).await;
        log.append(records(25)).await.unwrap();

        let start = log
            .request_truncate(Offset::new(7), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(start, Offset::new(7));
        assert_eq!(log.read(Offset::new(7), 1).await.unwrap()[0].offset, Offset::new(7));
        assert!(matches!(
            log.read(Offset::new(6), 1).await,
            Err(PartitionError::OffsetOutOfRange { offset: 6, start: 7, .. })
        ));

        let metadata = log.metadata().await;
        assert_eq!(metadata.start_offset, Offset::new(7));
        assert_eq!(metadata.high_watermark, Offset::new(25));
        assert_eq!(metadata.leader, Some(NodeId::new(1)));
    }

    #[tokio::test]
    async fn test_truncate_bounds() {
        let (_, log) = open(&SimulatedStorage::new()).await;
        let timeout = Duration::from_secs(1);
        assert!(log.request_truncate(Offset::new(0), timeout).await.is_err());

        log.append(records(1)).await.unwrap();
        assert!(log.request_truncate(Offset::new(0), timeout).await.is_err());
        assert!(log.request_truncate(Offset::new(2), timeout).await.is_err());
        assert_eq!(
            log.request_truncate(Offset::new(1), timeout).await.unwrap(),
            Offset::new(1)
        );
        // Truncated to the high watermark: nothing is readable.
        assert!(log.read(Offset::new(1), 10).await.unwrap().is_empty());
        assert!(log.read(Offset::new(0), 10).await.is_err());
    }

    #[tokio::test]
    async fn test_barrier_returns_current_start() {
        let (_, log) = open(&SimulatedStorage::new()).await;
        log.append(records(4)).await.unwrap();
        log.request_truncate(Offset::new(3), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            log.sync_effective_start(Duration::from_secs(1)).await.unwrap(),
            Offset::new(3)
        );
        assert!(log.validate_fetch_offset(Offset::new(3)).is_ok());
        assert!(log.validate_fetch_offset(Offset::new(2)).is_err());
    }

    #[tokio::test]
    async fn test_closed_log_rejects_requests() {
        let (_, log) = open(&SimulatedStorage::new()).await;
        log.append(records(2)).await.unwrap();
        log.shutdown().await;
        assert!(matches!(
            log.request_truncate(Offset::new(1), Duration::from_secs(1)).await,
            Err(PartitionError::ShuttingDown)
        ));
        assert!(matches!(
            log.append(records(1)).await,
            Err(PartitionError::ShuttingDown)
        ));
        // Shutting down twice is harmless.
        log.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_removes_files() {
        let storage = SimulatedStorage::new();
        let (_, log) = open(&storage).await;
        log.append(records(30)).await.unwrap();
        log.request_truncate(Offset::new(5), Duration::from_secs(1))
            .await
            .unwrap();
        log.destroy().await.unwrap();
        assert!(storage.files_in(std::path::Path::new("/t/0"), "log").is_empty());
        assert!(!storage.contains(&std::path::Path::new("/t/0").join("MANIFEST")));
    }
}
