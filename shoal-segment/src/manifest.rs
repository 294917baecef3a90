//! Segment manifest.
//!
//! The manifest is the authoritative list of live segments of a partition,
//! oldest first; the last entry is the active segment.
//!
//! ```text
//! +----------+----------+----------+------------------+----------+
//! |  Magic   | Version  |  Count   | Base offsets     |  CRC32   |
//! | (8 bytes)| (4 bytes)| (4 bytes)| (8 bytes * N)    | (4 bytes)|
//! +----------+----------+----------+------------------+----------+
//! ```
//!
//! The CRC covers everything before it. Commits go through a temp file and
//! a rename, so a reader sees either the old or the new manifest in full.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shoal_core::Offset;

use crate::error::{SegmentError, SegmentResult};
use crate::limits::SEGMENTS_PER_PARTITION_MAX;
use crate::storage::{write_atomic, Storage};

/// File name of the manifest.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

const MANIFEST_MAGIC: &[u8; 8] = b"SHOALMAN";
const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FIXED_SIZE: usize = 8 + 4 + 4 + 4;

/// Ordered list of live segment base offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    segments: Vec<Offset>,
}

impl Manifest {
    /// Creates a manifest from base offsets in ascending order.
    #[must_use]
    pub const fn new(segments: Vec<Offset>) -> Self {
        Self { segments }
    }

    /// Base offsets of the live segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> &[Offset] {
        &self.segments
    }

    /// Base offset of the active segment.
    #[must_use]
    pub fn active(&self) -> Option<Offset> {
        self.segments.last().copied()
    }

    /// Path of the manifest within a partition directory.
    #[must_use]
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    /// Encodes the manifest.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Count bounded by SEGMENTS_PER_PARTITION_MAX.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MANIFEST_FIXED_SIZE + self.segments.len() * 8);
        buf.put_slice(MANIFEST_MAGIC);
        buf.put_u32_le(MANIFEST_VERSION);
        buf.put_u32_le(self.segments.len() as u32);
        for base in &self.segments {
            buf.put_u64_le(base.get());
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes a manifest.
    ///
    /// # Errors
    /// Returns `ManifestCorrupt` if any check fails.
    pub fn decode(data: &[u8]) -> SegmentResult<Self> {
        if data.len() < MANIFEST_FIXED_SIZE {
            return Err(SegmentError::ManifestCorrupt {
                reason: "file too short",
            });
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let mut crc_buf = crc_bytes;
        if crc32fast::hash(body) != crc_buf.get_u32_le() {
            return Err(SegmentError::ManifestCorrupt {
                reason: "checksum mismatch",
            });
        }

        let mut buf = body;
        if &buf[..8] != MANIFEST_MAGIC {
            return Err(SegmentError::ManifestCorrupt {
                reason: "bad magic",
            });
        }
        buf.advance(8);
        if buf.get_u32_le() != MANIFEST_VERSION {
            return Err(SegmentError::ManifestCorrupt {
                reason: "unsupported version",
            });
        }
        let count = buf.get_u32_le();
        if count > SEGMENTS_PER_PARTITION_MAX || buf.remaining() != count as usize * 8 {
            return Err(SegmentError::ManifestCorrupt {
                reason: "segment count mismatch",
            });
        }

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let base = Offset::new(buf.get_u64_le());
            if segments.last().is_some_and(|prev| *prev >= base) {
                return Err(SegmentError::ManifestCorrupt {
                    reason: "segments out of order",
                });
            }
            segments.push(base);
        }
        Ok(Self { segments })
    }

    /// Loads the manifest from `dir`, or `None` if none was ever committed.
    ///
    /// # Errors
    /// Returns an error if the manifest exists but cannot be read or decoded.
    pub async fn load(storage: &dyn Storage, dir: &Path) -> SegmentResult<Option<Self>> {
        let path = Self::path(dir);
        if !storage.exists(&path).await? {
            return Ok(None);
        }
        let data = storage.open(&path).await?.read_all().await?;
        Self::decode(&data).map(Some)
    }

    /// Durably replaces the manifest in `dir`.
    ///
    /// # Errors
    /// Returns an error if the write, sync or rename fails. The previously
    /// committed manifest stays in place on failure.
    pub async fn commit(&self, storage: &dyn Storage, dir: &Path) -> SegmentResult<()> {
        write_atomic(storage, &Self::path(dir), &self.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimulatedStorage;

    fn offsets(values: &[u64]) -> Vec<Offset> {
        values.iter().copied().map(Offset::new).collect()
    }

    #[tokio::test]
    async fn test_commit_and_load() {
        let storage = SimulatedStorage::new();
        let dir = PathBuf::from("/p");
        assert_eq!(Manifest::load(&storage, &dir).await.unwrap(), None);

        let manifest = Manifest::new(offsets(&[0, 100, 250]));
        manifest.commit(&storage, &dir).await.unwrap();

        let loaded = Manifest::load(&storage, &dir).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.active(), Some(Offset::new(250)));
        assert!(!storage.contains(&dir.join("MANIFEST.tmp")));
    }

    #[test]
    fn test_decode_rejects_flipped_bit() {
        let mut raw = Manifest::new(offsets(&[0, 10])).encode().to_vec();
        raw[14] ^= 0x01;
        let err = Manifest::decode(&raw).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_decode_rejects_unordered() {
        // Build by hand so the CRC is valid but the order is not.
        let mut buf = BytesMut::new();
        buf.put_slice(MANIFEST_MAGIC);
        buf.put_u32_le(MANIFEST_VERSION);
        buf.put_u32_le(2);
        buf.put_u64_le(50);
        buf.put_u64_le(10);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        assert!(matches!(
            Manifest::decode(&buf),
            Err(SegmentError::ManifestCorrupt {
                reason: "segments out of order"
            })
        ));
    }
}
