//! Segment store: the set of segment files backing one partition.
//!
//! # Crash consistency
//!
//! The manifest is the last step of every change to the segment set:
//!
//! - **Roll**: seal the active segment, create the new file, commit the
//!   manifest. A crash before the commit leaves an unlisted file, which
//!   recovery deletes.
//! - **Remove**: delete the files, then commit the manifest. A crash before
//!   the commit leaves listed entries without a file, which recovery drops
//!   before re-committing the manifest.
//!
//! Either way a segment is never tracked after its file is gone, and never
//! deleted while a committed manifest still needs it for reads.

use std::path::PathBuf;
use std::sync::Arc;

use shoal_core::{LogIndex, Offset, Record};
use tracing::{debug, info, warn};

use crate::batch::RecordBatch;
use crate::error::{SegmentError, SegmentResult};
use crate::limits::{SEGMENTS_PER_PARTITION_MAX, SEGMENT_SIZE_BYTES_MAX};
use crate::manifest::Manifest;
use crate::segment::{Segment, SegmentInfo, SEGMENT_EXTENSION};
use crate::storage::Storage;

/// Segment roll thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Roll once the active segment would exceed this many bytes.
    pub max_segment_bytes: u64,
    /// Roll once the active segment would exceed this many records.
    pub max_segment_records: u64,
}

impl SegmentConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_segment_bytes: 128 * 1024 * 1024,
            max_segment_records: 1_000_000,
        }
    }

    /// Small segments so tests roll often.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_segment_bytes: 64 * 1024,
            max_segment_records: 100,
        }
    }

    /// Sets the byte threshold.
    ///
    /// # Panics
    /// Panics if `bytes` is zero or above the segment size limit.
    #[must_use]
    pub const fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        assert!(
            bytes > 0 && bytes <= SEGMENT_SIZE_BYTES_MAX,
            "segment size out of range"
        );
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the record threshold.
    ///
    /// # Panics
    /// Panics if `records` is zero.
    #[must_use]
    pub const fn with_max_segment_records(mut self, records: u64) -> Self {
        assert!(records > 0, "max_segment_records must be positive");
        self.max_segment_records = records;
        self
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every segment of a partition.
pub struct SegmentStore {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
    config: SegmentConfig,
    /// Ascending by base offset.
    sealed: Vec<Segment>,
    active: Segment,
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("sealed", &self.sealed)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SegmentStore {
    /// Opens the store in `dir`, reconciling files with the manifest.
    ///
    /// # Errors
    /// Returns an error if the manifest is corrupt, a sealed segment is
    /// corrupt, or storage fails.
    pub async fn open(
        storage: Arc<dyn Storage>,
        dir: impl Into<PathBuf>,
        config: SegmentConfig,
    ) -> SegmentResult<Self> {
        let dir = dir.into();
        storage.create_dir_all(&dir).await?;

        let manifest = Manifest::load(storage.as_ref(), &dir).await?;
        let on_disk = storage.list_files(&dir, SEGMENT_EXTENSION).await?;

        let Some(manifest) = manifest else {
            return Self::create_fresh(storage, dir, config, &on_disk).await;
        };
        let Some((&active_base, sealed_bases)) = manifest.segments().split_last() else {
            return Err(SegmentError::ManifestCorrupt {
                reason: "manifest lists no segments",
            });
        };

        let mut recommit = false;
        let mut sealed = Vec::with_capacity(sealed_bases.len());
        for &base in sealed_bases {
            if storage.exists(&Segment::path_for(&dir, base)).await? {
                sealed.push(Segment::open(storage.as_ref(), &dir, base, true).await?);
            } else {
                info!(
                    dir = %dir.display(),
                    base_offset = base.get(),
                    "Dropping segment removed before manifest commit"
                );
                recommit = true;
            }
        }

        let active = if storage.exists(&Segment::path_for(&dir, active_base)).await? {
            Segment::open(storage.as_ref(), &dir, active_base, false).await?
        } else {
            warn!(
                dir = %dir.display(),
                base_offset = active_base.get(),
                "Active segment missing, recreating empty"
            );
            Segment::create(storage.as_ref(), &dir, active_base).await?
        };

        for path in on_disk {
            let listed = Segment::parse_base_offset(&path)
                .is_some_and(|b| manifest.segments().contains(&b));
            if !listed {
                warn!(path = %path.display(), "Removing segment file not in manifest");
                storage.remove(&path).await?;
            }
        }

        let store = Self {
            storage,
            dir,
            config,
            sealed,
            active,
        };
        if recommit {
            store.commit_manifest().await?;
        }

        info!(
            dir = %store.dir.display(),
            segments = store.segment_count(),
            first_offset = store.first_offset().get(),
            log_end_offset = store.log_end_offset().get(),
            "Opened segment store"
        );
        Ok(store)
    }

    async fn create_fresh(
        storage: Arc<dyn Storage>,
        dir: PathBuf,
        config: SegmentConfig,
        stray: &[PathBuf],
    ) -> SegmentResult<Self> {
        // Without a manifest nothing was ever committed.
        for path in stray {
            warn!(path = %path.display(), "Removing segment file without manifest");
            storage.remove(path).await?;
        }
        let active = Segment::create(storage.as_ref(), &dir, Offset::new(0)).await?;
        let store = Self {
            storage,
            dir,
            config,
            sealed: Vec::new(),
            active,
        };
        store.commit_manifest().await?;
        debug!(dir = %store.dir.display(), "Created segment store");
        Ok(store)
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &Segment> {
        self.sealed.iter().chain(std::iter::once(&self.active))
    }

    async fn commit_manifest(&self) -> SegmentResult<()> {
        let manifest = Manifest::new(self.iter().map(Segment::base_offset).collect());
        manifest.commit(self.storage.as_ref(), &self.dir).await
    }

    /// Appends `records` as one batch produced by `log_index`, rolling the
    /// active segment first if the batch would overflow it.
    ///
    /// Returns the offset assigned to the first record.
    ///
    /// # Errors
    /// Returns an error if the batch is invalid or storage fails.
    pub async fn append(
        &mut self,
        log_index: LogIndex,
        records: Vec<Record>,
    ) -> SegmentResult<Offset> {
        let base_offset = self.log_end_offset();
        let batch = RecordBatch::new(log_index, base_offset, records);

        let over_bytes =
            self.active.size_bytes() + batch.encoded_size() > self.config.max_segment_bytes;
        let over_records = self.active.record_count() + batch.records.len() as u64
            > self.config.max_segment_records;
        if !self.active.is_empty() && (over_bytes || over_records) {
            self.roll().await?;
        }

        self.active.append(&batch).await?;
        Ok(base_offset)
    }

    /// Seals the active segment and starts a new one at the log end offset.
    ///
    /// Does nothing if the active segment is empty.
    ///
    /// # Errors
    /// Returns an error if the new file or the manifest cannot be written; the
    /// previous active segment then stays active.
    pub async fn roll(&mut self) -> SegmentResult<()> {
        if self.active.is_empty() {
            return Ok(());
        }
        if self.segment_count() >= SEGMENTS_PER_PARTITION_MAX as usize {
            return Err(SegmentError::io("roll", "too many segments"));
        }

        let base_offset = self.log_end_offset();
        let next = Segment::create(self.storage.as_ref(), &self.dir, base_offset).await?;
        let mut previous = std::mem::replace(&mut self.active, next);
        previous.seal();
        self.sealed.push(previous);

        if let Err(e) = self.commit_manifest().await {
            if let Some(mut previous) = self.sealed.pop() {
                previous.unseal();
                let abandoned = std::mem::replace(&mut self.active, previous);
                let path = abandoned.path().to_path_buf();
                drop(abandoned);
                if let Err(remove_err) = self.storage.remove(&path).await {
                    warn!(
                        path = %path.display(),
                        error = %remove_err,
                        "Failed to remove abandoned segment"
                    );
                }
            }
            return Err(e);
        }

        info!(
            dir = %self.dir.display(),
            base_offset = base_offset.get(),
            segments = self.segment_count(),
            "Rolled segment"
        );
        Ok(())
    }

    /// Reads up to `max_records` records starting at `from`.
    ///
    /// This is a physical read: it does not know about the partition's
    /// logical start offset.
    ///
    /// # Errors
    /// Returns an error if a segment cannot be read.
    pub async fn read(&self, from: Offset, max_records: usize) -> SegmentResult<Vec<Record>> {
        let mut records = Vec::new();
        for segment in self.iter().filter(|s| s.next_offset() > from) {
            if records.len() >= max_records {
                break;
            }
            let batch = segment.read(from, max_records - records.len()).await?;
            records.extend(batch);
        }
        Ok(records)
    }

    /// Offset of the first record still on disk.
    #[must_use]
    pub fn first_offset(&self) -> Offset {
        self.sealed
            .first()
            .map_or(self.active.base_offset(), Segment::base_offset)
    }

    /// Offset the next appended record will receive.
    #[must_use]
    pub const fn log_end_offset(&self) -> Offset {
        self.active.next_offset()
    }

    /// Log index of the newest batch on disk.
    #[must_use]
    pub fn last_log_index(&self) -> Option<LogIndex> {
        self.iter().rev().find_map(Segment::last_log_index)
    }

    /// Base offset of the batch written by `log_index`, if still on disk.
    #[must_use]
    pub fn base_offset_of(&self, log_index: LogIndex) -> Option<Offset> {
        self.iter().rev().find_map(|s| s.base_offset_of(log_index))
    }

    /// Sealed segments whose every record lies below `offset`, oldest first.
    #[must_use]
    pub fn segments_below(&self, offset: Offset) -> Vec<SegmentInfo> {
        self.sealed
            .iter()
            .map(Segment::info)
            .filter(|info| info.next_offset <= offset)
            .collect()
    }

    /// Descriptors of every live segment, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.iter().map(Segment::info).collect()
    }

    /// Removes sealed segments: files first, then the manifest.
    ///
    /// Segments that are already gone are skipped. Returns how many were
    /// removed by this call.
    ///
    /// # Errors
    /// Returns `ActiveSegment` if asked to remove the active segment, or a
    /// storage error. Files deleted before a failure are still dropped from
    /// the manifest.
    pub async fn remove(&mut self, infos: &[SegmentInfo]) -> SegmentResult<usize> {
        let active_base = self.active.base_offset();
        if infos.iter().any(|i| i.base_offset == active_base) {
            return Err(SegmentError::ActiveSegment {
                base_offset: active_base.get(),
            });
        }

        let mut removed = 0;
        let mut failure = None;
        for info in infos {
            let Some(pos) = self
                .sealed
                .iter()
                .position(|s| s.base_offset() == info.base_offset)
            else {
                continue;
            };
            let path = self.sealed[pos].path().to_path_buf();
            match self.storage.remove(&path).await {
                Ok(()) => {
                    self.sealed.remove(pos);
                    removed += 1;
                    debug!(path = %path.display(), "Deleted segment file");
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if removed > 0 {
            self.commit_manifest().await?;
            info!(
                dir = %self.dir.display(),
                removed,
                first_offset = self.first_offset().get(),
                "Removed segments"
            );
        }
        failure.map_or(Ok(removed), Err)
    }

    /// Total bytes across all segments.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.iter().map(Segment::size_bytes).sum()
    }

    /// Number of live segments, including the active one.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    /// Deletes every segment file and the manifest.
    ///
    /// The store must not be used afterwards.
    ///
    /// # Errors
    /// Returns an error if a file cannot be removed.
    pub async fn destroy(&mut self) -> SegmentResult<()> {
        for segment in self.sealed.drain(..) {
            let path = segment.path().to_path_buf();
            drop(segment);
            self.storage.remove(&path).await?;
        }
        self.storage.remove(self.active.path()).await?;
        self.storage.remove(&Manifest::path(&self.dir)).await?;
        info!(dir = %self.dir.display(), "Destroyed segment store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SimulatedStorage, StorageFaultConfig};
    use std::path::Path;

    fn records(count: usize) -> Vec<Record> {
        (0..count).map(|i| Record::new(format!("value-{i}"))).collect()
    }

    fn config() -> SegmentConfig {
        SegmentConfig::for_testing().with_max_segment_records(10)
    }

    async fn store_with(storage: &SimulatedStorage, batches: u64) -> SegmentStore {
        let mut store = SegmentStore::open(Arc::new(storage.clone()), "/t/0", config())
            .await
            .unwrap();
        for i in 1..=batches {
            store.append(LogIndex::new(i), records(5)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_fresh_store() {
        let storage = SimulatedStorage::new();
        let store = store_with(&storage, 0).await;
        assert_eq!(store.first_offset(), Offset::new(0));
        assert_eq!(store.log_end_offset(), Offset::new(0));
        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.last_log_index(), None);
        assert!(storage.contains(Path::new("/t/0/MANIFEST")));
    }

    #[tokio::test]
    async fn test_append_rolls_on_record_limit() {
        let storage = SimulatedStorage::new();
        let store = store_with(&storage, 5).await;

        // 10 records per segment: [0,10) [10,20) [20,25)
        let infos = store.segments();
        let bases: Vec<u64> = infos.iter().map(|i| i.base_offset.get()).collect();
        assert_eq!(bases, vec![0, 10, 20]);
        assert!(infos[0].sealed && infos[1].sealed && !infos[2].sealed);
        assert_eq!(store.log_end_offset(), Offset::new(25));
        assert_eq!(store.last_log_index(), Some(LogIndex::new(5)));
        assert_eq!(store.base_offset_of(LogIndex::new(3)), Some(Offset::new(10)));

        let read = store.read(Offset::new(8), 4).await.unwrap();
        let offsets: Vec<u64> = read.iter().map(|r| r.offset.get()).collect();
        assert_eq!(offsets, vec![8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_segments_below_excludes_partial_and_active() {
        let storage = SimulatedStorage::new();
        let store = store_with(&storage, 5).await;

        assert!(store.segments_below(Offset::new(9)).is_empty());
        assert_eq!(store.segments_below(Offset::new(10)).len(), 1);
        assert_eq!(store.segments_below(Offset::new(19)).len(), 1);
        // The active segment [20,25) never qualifies.
        assert_eq!(store.segments_below(Offset::new(25)).len(), 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_persists() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 5).await;

        let below = store.segments_below(Offset::new(20));
        assert_eq!(store.remove(&below).await.unwrap(), 2);
        assert_eq!(store.remove(&below).await.unwrap(), 0);
        assert_eq!(store.first_offset(), Offset::new(20));
        drop(store);

        let reopened = store_with(&storage, 0).await;
        assert_eq!(reopened.first_offset(), Offset::new(20));
        assert_eq!(reopened.log_end_offset(), Offset::new(25));
        assert_eq!(storage.files_in(Path::new("/t/0"), "log").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_active_rejected() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 1).await;
        let active = store.segments();
        assert!(matches!(
            store.remove(&active).await,
            Err(SegmentError::ActiveSegment { base_offset: 0 })
        ));
        assert_eq!(store.log_end_offset(), Offset::new(5));
    }

    #[tokio::test]
    async fn test_partial_remove_failure_keeps_tracking_consistent() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 7).await;
        let below = store.segments_below(Offset::new(30));
        assert_eq!(below.len(), 3);

        *storage.fault_config() = StorageFaultConfig::none().with_fail_remove_after(1);
        assert!(store.remove(&below).await.is_err());
        assert_eq!(store.first_offset(), Offset::new(10));
        storage.clear_faults();
        drop(store);

        // The manifest no longer lists the deleted file.
        let reopened = store_with(&storage, 0).await;
        assert_eq!(reopened.first_offset(), Offset::new(10));
        assert_eq!(reopened.segment_count(), 3);
    }

    #[tokio::test]
    async fn test_crash_between_delete_and_manifest_commit() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 5).await;

        // Files vanish, manifest commit fails.
        storage.fault_config().fail_renames = true;
        let below = store.segments_below(Offset::new(20));
        assert!(store.remove(&below).await.is_err());
        drop(store);
        storage.clear_faults();

        let reopened = store_with(&storage, 0).await;
        assert_eq!(reopened.first_offset(), Offset::new(20));
        let manifest = Manifest::load(&storage, Path::new("/t/0")).await.unwrap().unwrap();
        assert_eq!(manifest.segments(), &[Offset::new(20)]);
    }

    #[tokio::test]
    async fn test_uncommitted_roll_file_removed_on_open() {
        let storage = SimulatedStorage::new();
        let store = store_with(&storage, 1).await;
        drop(store);

        let stray = Segment::path_for(Path::new("/t/0"), Offset::new(5));
        storage.set_raw_content(&stray, Vec::new());

        let reopened = store_with(&storage, 0).await;
        assert!(!storage.contains(&stray));
        assert_eq!(reopened.segment_count(), 1);
        assert_eq!(reopened.log_end_offset(), Offset::new(5));
    }

    #[tokio::test]
    async fn test_failed_roll_keeps_active() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 2).await;
        assert_eq!(store.segment_count(), 1);

        storage.fault_config().fail_renames = true;
        assert!(store.append(LogIndex::new(3), records(5)).await.is_err());
        storage.clear_faults();
        assert_eq!(store.segment_count(), 1);
        assert_eq!(storage.files_in(Path::new("/t/0"), "log").len(), 1);

        let base = store.append(LogIndex::new(3), records(5)).await.unwrap();
        assert_eq!(base, Offset::new(10));
        assert_eq!(store.segment_count(), 2);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let storage = SimulatedStorage::new();
        let mut store = store_with(&storage, 3).await;
        store.destroy().await.unwrap();
        assert!(storage.files_in(Path::new("/t/0"), "log").is_empty());
        assert!(!storage.contains(Path::new("/t/0/MANIFEST")));
    }
}
