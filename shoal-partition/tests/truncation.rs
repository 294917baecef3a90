//! Integration tests for prefix truncation of a partition log.
//!
//! These tests drive a `PartitionLog` through its public API over simulated
//! storage, restarting it the way a replica restarts: dropping the handle
//! mid-flight and reopening it on the same files with a commit stream that
//! replays the command log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shoal_core::{NodeId, Offset, ProducerId, Record};
use shoal_partition::{
    LocalReplicator, PartitionError, PartitionLog, PartitionLogConfig, Replicator,
    EVICTION_STATE_FILE_NAME,
};
use shoal_segment::{SegmentConfig, SimulatedStorage, Storage, StorageFaultConfig, TokioStorage};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DIR: &str = "/data/topic-1/0";
const TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(dir: &Path) -> PartitionLogConfig {
    PartitionLogConfig::for_testing(dir)
        .with_segment(SegmentConfig::for_testing().with_max_segment_records(10))
}

/// Opens a partition on `storage` using the replicator's full command log.
async fn open_on(
    storage: Arc<dyn Storage>,
    dir: &Path,
    replicator: &Arc<LocalReplicator>,
) -> PartitionLog {
    PartitionLog::open(
        config(dir),
        storage,
        Arc::clone(replicator) as Arc<dyn Replicator>,
        replicator.subscribe(),
    )
    .await
    .unwrap()
}

async fn open(storage: &SimulatedStorage, replicator: &Arc<LocalReplicator>) -> PartitionLog {
    open_on(Arc::new(storage.clone()), Path::new(DIR), replicator).await
}

fn records(count: usize) -> Vec<Record> {
    (0..count).map(|i| Record::new(format!("value-{i}"))).collect()
}

/// Appends three batches of ten: segments [0,10) [10,20) and active [20,30).
async fn fill(log: &PartitionLog) {
    for _ in 0..3 {
        log.append(records(10)).await.unwrap();
    }
}

async fn wait_for_eviction(log: &PartitionLog) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.pending_eviction().is_some() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("eviction did not complete");
}

fn segment_files(storage: &SimulatedStorage) -> usize {
    storage.files_in(Path::new(DIR), "log").len()
}

#[tokio::test]
async fn test_boundary_is_exact() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;

    assert_eq!(log.request_truncate(Offset::new(15), TIMEOUT).await.unwrap(), Offset::new(15));
    assert_eq!(log.read(Offset::new(15), 1).await.unwrap()[0].offset, Offset::new(15));
    assert!(matches!(
        log.read(Offset::new(14), 1).await,
        Err(PartitionError::OffsetOutOfRange { .. })
    ));

    wait_for_eviction(&log).await;
    // [10,20) straddles the new start and is kept whole.
    assert_eq!(segment_files(&storage), 2);
    let metadata = log.metadata().await;
    assert_eq!(metadata.segment_count, 2);
    assert_eq!(metadata.start_offset, Offset::new(15));
    assert_eq!(metadata.high_watermark, Offset::new(30));
}

#[tokio::test]
async fn test_restart_replays_without_duplicates() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;
    log.request_truncate(Offset::new(15), TIMEOUT).await.unwrap();
    wait_for_eviction(&log).await;
    log.shutdown().await;
    drop(log);

    let log = open(&storage, &replicator).await;
    assert_eq!(log.sync_effective_start(TIMEOUT).await.unwrap(), Offset::new(15));
    assert_eq!(log.high_watermark(), Offset::new(30));
    assert_eq!(log.read(Offset::new(15), 100).await.unwrap().len(), 15);

    // The replayed truncation did not move anything; a repeat is stale.
    assert!(matches!(
        log.request_truncate(Offset::new(15), TIMEOUT).await,
        Err(PartitionError::OffsetOutOfRange { .. })
    ));
    assert_eq!(log.append(records(1)).await.unwrap(), Offset::new(30));
}

#[tokio::test]
async fn test_open_transaction_defers_eviction() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    let producer = ProducerId::new(7);

    log.append(records(10)).await.unwrap();
    assert_eq!(
        log.append_transactional(producer, records(10)).await.unwrap(),
        Offset::new(10)
    );
    log.append(records(10)).await.unwrap();
    assert_eq!(log.last_stable_offset(), Offset::new(10));

    // Logical truncation succeeds at once.
    log.request_truncate(Offset::new(25), TIMEOUT).await.unwrap();
    assert_eq!(log.start_offset(), Offset::new(25));
    assert!(log.read(Offset::new(12), 1).await.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.pending_eviction(), Some(Offset::new(25)));
    assert_eq!(segment_files(&storage), 3);

    log.end_transaction(producer, true).await.unwrap();
    wait_for_eviction(&log).await;
    assert_eq!(segment_files(&storage), 1);
    assert_eq!(log.last_stable_offset(), Offset::new(30));
}

#[tokio::test]
async fn test_gate_is_rebuilt_by_replay() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let producer = ProducerId::new(7);
    {
        let log = open(&storage, &replicator).await;
        log.append(records(10)).await.unwrap();
        log.append_transactional(producer, records(10)).await.unwrap();
        log.append(records(10)).await.unwrap();
        log.request_truncate(Offset::new(25), TIMEOUT).await.unwrap();
        log.shutdown().await;
    }

    let log = open(&storage, &replicator).await;
    log.sync_effective_start(TIMEOUT).await.unwrap();
    assert_eq!(log.last_stable_offset(), Offset::new(10));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.pending_eviction(), Some(Offset::new(25)));
    assert_eq!(segment_files(&storage), 3);

    log.end_transaction(producer, false).await.unwrap();
    wait_for_eviction(&log).await;
    assert_eq!(segment_files(&storage), 1);
}

#[tokio::test]
async fn test_crash_mid_eviction_resumes_on_restart() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;

    *storage.fault_config() = StorageFaultConfig::none().with_fail_remove_after(0);
    log.request_truncate(Offset::new(20), TIMEOUT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(log.pending_eviction(), Some(Offset::new(20)));
    assert_eq!(segment_files(&storage), 3);

    // Crash: background tasks are aborted, nothing is flushed.
    drop(log);
    storage.clear_faults();

    let log = open(&storage, &replicator).await;
    assert_eq!(log.start_offset(), Offset::new(20));
    wait_for_eviction(&log).await;
    assert_eq!(segment_files(&storage), 1);
    assert_eq!(log.metadata().await.segment_count, 1);
}

#[tokio::test]
async fn test_command_log_restores_lost_eviction_state() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;
    log.request_truncate(Offset::new(15), TIMEOUT).await.unwrap();
    wait_for_eviction(&log).await;
    log.shutdown().await;
    drop(log);

    storage
        .remove(&Path::new(DIR).join(EVICTION_STATE_FILE_NAME))
        .await
        .unwrap();

    // Segments alone only say 10; the replayed command says 15.
    let log = open(&storage, &replicator).await;
    assert_eq!(log.sync_effective_start(TIMEOUT).await.unwrap(), Offset::new(15));
    assert!(log.read(Offset::new(14), 1).await.is_err());
}

#[tokio::test]
async fn test_next_truncation_sweeps_gated_orphans() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let producer = ProducerId::new(3);
    {
        let log = open(&storage, &replicator).await;
        log.append_transactional(producer, records(10)).await.unwrap();
        fill(&log).await;
        log.request_truncate(Offset::new(15), TIMEOUT).await.unwrap();
        log.shutdown().await;
    }

    // Recovery is held back by the replayed transaction.
    let log = open(&storage, &replicator).await;
    assert_eq!(log.sync_effective_start(TIMEOUT).await.unwrap(), Offset::new(15));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.pending_eviction(), Some(Offset::new(15)));
    assert_eq!(segment_files(&storage), 4);

    log.end_transaction(producer, false).await.unwrap();
    assert_eq!(log.request_truncate(Offset::new(35), TIMEOUT).await.unwrap(), Offset::new(35));
    wait_for_eviction(&log).await;
    // Only the active segment [30,40) is left.
    assert_eq!(segment_files(&storage), 1);
    assert_eq!(log.read(Offset::new(35), 10).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_failed_append_matches_fresh_replica() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    log.append(vec![Record::new("a")]).await.unwrap();

    storage.fault_config().force_write_fail = true;
    assert_eq!(log.append(vec![Record::new("b")]).await.unwrap(), Offset::new(1));
    assert_eq!(log.append(vec![Record::new("c")]).await.unwrap(), Offset::new(2));
    log.shutdown().await;
    drop(log);

    // A restarted replica and one built from the command log alone agree.
    let restarted = open(&storage, &replicator).await;
    let fresh_storage = SimulatedStorage::new();
    let fresh = open(&fresh_storage, &replicator).await;
    for log in [&restarted, &fresh] {
        log.sync_effective_start(TIMEOUT).await.unwrap();
        assert_eq!(log.high_watermark(), Offset::new(3));
        let read = log.read(Offset::new(0), 10).await.unwrap();
        let values: Vec<_> = read.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }
}

#[tokio::test]
async fn test_stalled_append_is_applied_after_restart() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    log.append(records(10)).await.unwrap();

    // The next append must roll, and rolling cannot commit the manifest.
    storage.fault_config().fail_renames = true;
    let stalled = tokio::time::timeout(Duration::from_millis(50), log.append(records(1))).await;
    assert!(stalled.is_err());
    assert_eq!(log.high_watermark(), Offset::new(10));
    log.shutdown().await;
    drop(log);

    storage.clear_faults();
    let log = open(&storage, &replicator).await;
    log.sync_effective_start(TIMEOUT).await.unwrap();
    assert_eq!(log.high_watermark(), Offset::new(11));
    assert_eq!(log.append(records(1)).await.unwrap(), Offset::new(11));
}

#[tokio::test]
async fn test_leadership_loss_has_no_effect() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;

    replicator.step_down(Some(NodeId::new(2)));
    let err = log.request_truncate(Offset::new(5), TIMEOUT).await.unwrap_err();
    assert!(matches!(
        err,
        PartitionError::NotLeader { leader_hint: Some(id) } if id == NodeId::new(2)
    ));
    assert!(err.is_retriable());
    assert_eq!(log.start_offset(), Offset::new(0));

    replicator.become_leader();
    assert_eq!(log.request_truncate(Offset::new(5), TIMEOUT).await.unwrap(), Offset::new(5));
    assert_eq!(log.leader_epoch(), replicator.term());
}

#[tokio::test]
async fn test_replication_timeout_has_no_effect() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = open(&storage, &replicator).await;
    fill(&log).await;
    let committed = replicator.committed_len();

    replicator.pause_commits();
    let err = log
        .request_truncate(Offset::new(5), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::Timeout { .. }));
    replicator.resume_commits();

    assert_eq!(replicator.committed_len(), committed);
    assert_eq!(log.sync_effective_start(TIMEOUT).await.unwrap(), Offset::new(0));
}

#[tokio::test]
async fn test_concurrent_truncations_converge() {
    init_tracing();
    let storage = SimulatedStorage::new();
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));
    let log = Arc::new(open(&storage, &replicator).await);
    for _ in 0..10 {
        log.append(records(10)).await.unwrap();
    }

    let tasks: Vec<_> = (1..=10u64)
        .map(|i| {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.request_truncate(Offset::new(i * 10), TIMEOUT).await })
        })
        .collect();

    for task in tasks {
        match task.await.unwrap() {
            Ok(start) => assert!(start.get() % 10 == 0),
            Err(e) => assert!(matches!(e, PartitionError::OffsetOutOfRange { .. }), "{e}"),
        }
        let watermarks = log.watermarks();
        assert!(watermarks.start_offset <= watermarks.high_watermark);
    }

    // Truncating to the high watermark is always valid, so it always lands.
    assert_eq!(log.start_offset(), Offset::new(100));
    assert!(log.read(Offset::new(100), 10).await.unwrap().is_empty());
    wait_for_eviction(&log).await;
    assert_eq!(segment_files(&storage), 1);
}

#[tokio::test]
async fn test_truncation_survives_restart_on_disk() {
    init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("topic-1").join("0");
    let storage: Arc<dyn Storage> = Arc::new(TokioStorage::new());
    let (replicator, _) = LocalReplicator::new(NodeId::new(1));

    let log = open_on(Arc::clone(&storage), &dir, &replicator).await;
    fill(&log).await;
    log.request_truncate(Offset::new(20), TIMEOUT).await.unwrap();
    wait_for_eviction(&log).await;
    log.shutdown().await;
    drop(log);

    let log = open_on(storage, &dir, &replicator).await;
    assert_eq!(log.start_offset(), Offset::new(20));
    assert_eq!(log.high_watermark(), Offset::new(30));
    let read = log.read(Offset::new(20), 100).await.unwrap();
    assert_eq!(read.len(), 10);
    assert_eq!(read[0].value, "value-0");
    assert_eq!(log.metadata().await.segment_count, 1);
}
