//! Segment files.
//!
//! A segment is a contiguous run of record batches in one file named after
//! its base offset (`00000000000000000125.log`). Only the newest segment of a
//! partition accepts appends; once sealed a segment is immutable until it is
//! removed as a whole.

use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use shoal_core::{LogIndex, Offset, Record};
use tracing::{debug, warn};

use crate::batch::{BatchHeader, RecordBatch, BATCH_HEADER_SIZE};
use crate::error::{SegmentError, SegmentResult};
use crate::storage::{Storage, StorageFile};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "log";

/// Descriptor of a segment, detached from its file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Offset of the first record.
    pub base_offset: Offset,
    /// Offset following the last record.
    pub next_offset: Offset,
    /// Size of the file in bytes.
    pub size_bytes: u64,
    /// Whether the segment still accepts appends.
    pub sealed: bool,
}

impl SegmentInfo {
    /// Offset of the last record, or `None` for an empty segment.
    #[must_use]
    pub const fn last_offset(&self) -> Option<Offset> {
        if self.next_offset.get() > self.base_offset.get() {
            self.next_offset.prev()
        } else {
            None
        }
    }

    /// Number of records.
    #[must_use]
    pub const fn record_count(&self) -> u64 {
        self.next_offset.get() - self.base_offset.get()
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchPosition {
    base_offset: Offset,
    next_offset: Offset,
    log_index: LogIndex,
    position: u64,
    length: u64,
}

/// An open segment file.
pub struct Segment {
    path: PathBuf,
    file: Box<dyn StorageFile>,
    base_offset: Offset,
    next_offset: Offset,
    size_bytes: u64,
    sealed: bool,
    batches: Vec<BatchPosition>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .field("next_offset", &self.next_offset)
            .field("size_bytes", &self.size_bytes)
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// File name for a segment starting at `base_offset`.
    #[must_use]
    pub fn file_name(base_offset: Offset) -> String {
        format!("{:020}.{SEGMENT_EXTENSION}", base_offset.get())
    }

    /// Path of the segment starting at `base_offset` within `dir`.
    #[must_use]
    pub fn path_for(dir: &Path, base_offset: Offset) -> PathBuf {
        dir.join(Self::file_name(base_offset))
    }

    /// Parses the base offset out of a segment path.
    #[must_use]
    pub fn parse_base_offset(path: &Path) -> Option<Offset> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse::<u64>().ok().map(Offset::new)
    }

    /// Creates an empty segment, discarding any stale file at the same path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub async fn create(
        storage: &dyn Storage,
        dir: &Path,
        base_offset: Offset,
    ) -> SegmentResult<Self> {
        let path = Self::path_for(dir, base_offset);
        let file = storage.open(&path).await?;
        if file.size().await? > 0 {
            file.truncate(0).await?;
        }
        file.sync().await?;

        debug!(path = %path.display(), base_offset = base_offset.get(), "Created segment");
        Ok(Self {
            path,
            file,
            base_offset,
            next_offset: base_offset,
            size_bytes: 0,
            sealed: false,
            batches: Vec::new(),
        })
    }

    /// Opens an existing segment and rebuilds its batch index.
    ///
    /// A damaged tail on an unsealed segment is treated as a torn write and
    /// truncated away. Damage inside a sealed segment is an error.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a sealed segment is
    /// corrupt.
    pub async fn open(
        storage: &dyn Storage,
        dir: &Path,
        base_offset: Offset,
        sealed: bool,
    ) -> SegmentResult<Self> {
        let path = Self::path_for(dir, base_offset);
        let file = storage.open(&path).await?;
        let data = file.read_all().await?;

        let mut segment = Self {
            path,
            file,
            base_offset,
            next_offset: base_offset,
            size_bytes: 0,
            sealed: false,
            batches: Vec::new(),
        };

        let mut buf = data.clone();
        while buf.has_remaining() {
            let position = segment.size_bytes;
            match Self::scan_batch(&mut buf, position, segment.next_offset) {
                Ok(entry) => {
                    segment.size_bytes += entry.length;
                    segment.next_offset = entry.next_offset;
                    segment.batches.push(entry);
                }
                Err(e) if sealed => return Err(e),
                Err(e) => {
                    warn!(
                        path = %segment.path.display(),
                        position,
                        file_size = data.len(),
                        error = %e,
                        "Truncating torn tail of active segment"
                    );
                    segment.file.truncate(position).await?;
                    segment.file.sync().await?;
                    break;
                }
            }
        }

        segment.sealed = sealed;
        Ok(segment)
    }

    fn scan_batch(
        buf: &mut Bytes,
        position: u64,
        expected_base: Offset,
    ) -> SegmentResult<BatchPosition> {
        let header = BatchHeader::decode(buf, position)?;
        if buf.remaining() < header.length as usize {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "truncated payload",
            });
        }
        let payload = buf.split_to(header.length as usize);
        header.verify(&payload, position)?;
        if header.base_offset != expected_base {
            return Err(SegmentError::InvalidBatch {
                position,
                reason: "base offset not contiguous",
            });
        }
        Ok(BatchPosition {
            base_offset: header.base_offset,
            next_offset: header.next_offset(),
            log_index: header.log_index,
            position,
            length: header.total_size(),
        })
    }

    /// Appends a batch and syncs it.
    ///
    /// # Errors
    /// Returns an error if the segment is sealed, the batch does not start at
    /// the segment's next offset, or the write fails.
    pub async fn append(&mut self, batch: &RecordBatch) -> SegmentResult<()> {
        if self.sealed {
            return Err(SegmentError::InvalidBatch {
                position: self.size_bytes,
                reason: "segment is sealed",
            });
        }
        if batch.base_offset != self.next_offset {
            return Err(SegmentError::InvalidBatch {
                position: self.size_bytes,
                reason: "base offset not contiguous",
            });
        }

        let encoded = batch.encode()?;
        let position = self.size_bytes;
        self.file.write_at(position, &encoded).await?;
        self.file.sync().await?;

        let entry = BatchPosition {
            base_offset: batch.base_offset,
            next_offset: batch.next_offset(),
            log_index: batch.log_index,
            position,
            length: encoded.len() as u64,
        };
        self.size_bytes += entry.length;
        self.next_offset = entry.next_offset;
        self.batches.push(entry);
        Ok(())
    }

    /// Reads up to `max_records` records starting at `from`.
    ///
    /// Offsets below the segment's base are read from the base.
    ///
    /// # Errors
    /// Returns an error if a batch cannot be read or fails its checksum.
    pub async fn read(&self, from: Offset, max_records: usize) -> SegmentResult<Vec<Record>> {
        let mut records = Vec::new();
        let first = self.batches.partition_point(|b| b.next_offset <= from);

        for entry in &self.batches[first..] {
            if records.len() >= max_records {
                break;
            }
            let length = usize::try_from(entry.length).unwrap_or(usize::MAX);
            let mut data = self.file.read_at(entry.position, length).await?;
            if data.len() < BATCH_HEADER_SIZE {
                return Err(SegmentError::InvalidBatch {
                    position: entry.position,
                    reason: "short read",
                });
            }
            let header = BatchHeader::decode(&mut data, entry.position)?;
            let batch = RecordBatch::decode_payload(&header, data, entry.position)?;
            let wanted = max_records - records.len();
            records.extend(
                batch
                    .records
                    .into_iter()
                    .filter(|r| r.offset >= from)
                    .take(wanted),
            );
        }
        Ok(records)
    }

    /// Seals the segment against further appends.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Reopens the segment for appends after a roll was abandoned.
    pub(crate) fn unseal(&mut self) {
        self.sealed = false;
    }

    /// Returns the segment descriptor.
    #[must_use]
    pub const fn info(&self) -> SegmentInfo {
        SegmentInfo {
            base_offset: self.base_offset,
            next_offset: self.next_offset,
            size_bytes: self.size_bytes,
            sealed: self.sealed,
        }
    }

    /// Offset of the first record.
    #[must_use]
    pub const fn base_offset(&self) -> Offset {
        self.base_offset
    }

    /// Offset following the last record.
    #[must_use]
    pub const fn next_offset(&self) -> Offset {
        self.next_offset
    }

    /// Size of the file in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true if the segment holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of records.
    #[must_use]
    pub const fn record_count(&self) -> u64 {
        self.next_offset.get() - self.base_offset.get()
    }

    /// Log index of the newest batch.
    #[must_use]
    pub fn last_log_index(&self) -> Option<LogIndex> {
        self.batches.last().map(|b| b.log_index)
    }

    /// Base offset of the batch written by `log_index`, if it lives here.
    #[must_use]
    pub fn base_offset_of(&self, log_index: LogIndex) -> Option<Offset> {
        self.batches
            .iter()
            .find(|b| b.log_index == log_index)
            .map(|b| b.base_offset)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
