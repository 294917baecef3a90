//! Replication seam.
//!
//! A partition submits encoded [`PartitionCommand`](crate::PartitionCommand)s
//! to a [`Replicator`] and applies whatever arrives on its [`CommitStream`],
//! in index order. The replicator decides the total order; the partition
//! never applies an entry that was not committed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_core::{LogIndex, NodeId, TermId};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ReplicationError, ReplicationResult};

/// An entry committed by the replication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    /// Position in the command log.
    pub index: LogIndex,
    /// Encoded command.
    pub data: Bytes,
}

/// Committed entries in index order.
pub type CommitStream = mpsc::UnboundedReceiver<CommittedEntry>;

/// Replication layer for one partition.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Replicates `data` and returns its index once committed.
    ///
    /// # Errors
    /// Returns `NotLeader`, `Timeout` or `ShuttingDown`; in every case the
    /// entry was not committed.
    async fn replicate(&self, data: Bytes, timeout: Duration) -> ReplicationResult<LogIndex>;

    /// Returns true if this replica currently leads the partition.
    fn is_leader(&self) -> bool;

    /// The current leader, if known.
    fn leader(&self) -> Option<NodeId>;

    /// The current term, used as the leader epoch.
    fn term(&self) -> TermId;

    /// Index of the newest committed entry.
    fn last_committed(&self) -> Option<LogIndex>;
}

// ----------------------------------------------------------------------------
// LocalReplicator
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct LocalState {
    log: Vec<CommittedEntry>,
    subscribers: Vec<mpsc::UnboundedSender<CommittedEntry>>,
    leader: Option<NodeId>,
    term: TermId,
    paused: bool,
    shut_down: bool,
}

/// Single-node replicator that commits on submit.
///
/// It retains the committed log so a restarted partition can
/// [`subscribe`](Self::subscribe) and replay it, and exposes hooks to lose
/// leadership or stall commits.
#[derive(Debug)]
pub struct LocalReplicator {
    node_id: NodeId,
    state: Mutex<LocalState>,
    changed: Notify,
}

impl LocalReplicator {
    /// Creates a replicator led by `node_id`, and its first commit stream.
    #[must_use]
    pub fn new(node_id: NodeId) -> (Arc<Self>, CommitStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let replicator = Arc::new(Self {
            node_id,
            state: Mutex::new(LocalState {
                log: Vec::new(),
                subscribers: vec![tx],
                leader: Some(node_id),
                term: TermId::new(1),
                paused: false,
                shut_down: false,
            }),
            changed: Notify::new(),
        });
        (replicator, rx)
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new commit stream that first replays every retained entry.
    #[must_use]
    pub fn subscribe(&self) -> CommitStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for entry in &state.log {
            // The receiver is still in hand; this cannot fail.
            let _ = tx.send(entry.clone());
        }
        state.subscribers.push(tx);
        rx
    }

    /// Hands leadership to `leader_hint` (or nobody).
    pub fn step_down(&self, leader_hint: Option<NodeId>) {
        let mut state = self.state();
        state.leader = leader_hint.filter(|l| *l != self.node_id);
        info!(node = %self.node_id, leader = ?state.leader, "Stepped down");
        drop(state);
        self.changed.notify_waiters();
    }

    /// Takes leadership in a new term.
    pub fn become_leader(&self) {
        let mut state = self.state();
        state.term = state.term.next();
        state.leader = Some(self.node_id);
        info!(node = %self.node_id, term = %state.term, "Became leader");
    }

    /// Holds back commits until [`resume_commits`](Self::resume_commits).
    pub fn pause_commits(&self) {
        self.state().paused = true;
    }

    /// Lets held-back submissions commit.
    pub fn resume_commits(&self) {
        self.state().paused = false;
        self.changed.notify_waiters();
    }

    /// Fails every current and future submission.
    pub fn shutdown(&self) {
        self.state().shut_down = true;
        self.changed.notify_waiters();
    }

    /// Number of committed entries.
    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.state().log.len()
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn replicate(&self, data: Bytes, timeout: Duration) -> ReplicationResult<LogIndex> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let changed = {
                let mut state = self.state();
                if state.shut_down {
                    return Err(ReplicationError::ShuttingDown);
                }
                if state.leader != Some(self.node_id) {
                    return Err(ReplicationError::NotLeader {
                        leader_hint: state.leader,
                    });
                }
                if !state.paused {
                    let index = LogIndex::new(state.log.len() as u64 + 1);
                    let entry = CommittedEntry { index, data };
                    state
                        .subscribers
                        .retain(|tx| tx.send(entry.clone()).is_ok());
                    state.log.push(entry);
                    debug!(node = %self.node_id, index = index.get(), "Committed entry");
                    return Ok(index);
                }
                // Registered before the lock is released so a resume between
                // here and the await is not missed.
                self.changed.notified()
            };
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                #[allow(clippy::cast_possible_truncation)]
                let waited_ms = started.elapsed().as_millis() as u64;
                return Err(ReplicationError::Timeout { waited_ms });
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.state().leader == Some(self.node_id)
    }

    fn leader(&self) -> Option<NodeId> {
        self.state().leader
    }

    fn term(&self) -> TermId {
        self.state().term
    }

    fn last_committed(&self) -> Option<LogIndex> {
        self.state().log.last().map(|e| e.index)
    }
}
