//! Persisted eviction state.
//!
//! ```text
//! +----------+----------+-------------+-----------+---------+-------------+----------+
//! |  Magic   | Version  | Last offset | Last index| Pending | Pending off | CRC32    |
//! | (8 bytes)| (4 bytes)|  (8 bytes)  | (8 bytes) | (1 byte)|  (8 bytes)  | (4 bytes)|
//! +----------+----------+-------------+-----------+---------+-------------+----------+
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shoal_core::{LogIndex, Offset};
use shoal_segment::{write_atomic, Storage};
use tracing::debug;

use crate::error::{PartitionError, PartitionResult};

/// File name of the eviction state within a partition directory.
pub const EVICTION_STATE_FILE_NAME: &str = "eviction.state";

const STATE_MAGIC: &[u8; 8] = b"SHOALEVS";
const STATE_VERSION: u32 = 1;
const STATE_SIZE: usize = 8 + 4 + 8 + 8 + 1 + 8 + 4;

/// Durable progress of prefix truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionState {
    /// Offset of the newest applied truncation command.
    pub last_applied_truncation_offset: Offset,
    /// Command log index of that command.
    pub last_applied_index: LogIndex,
    /// Truncation applied logically whose segments are not yet removed.
    pub pending_offset: Option<Offset>,
}

impl EvictionState {
    /// Encodes the state.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATE_SIZE);
        buf.put_slice(STATE_MAGIC);
        buf.put_u32_le(STATE_VERSION);
        buf.put_u64_le(self.last_applied_truncation_offset.get());
        buf.put_u64_le(self.last_applied_index.get());
        buf.put_u8(u8::from(self.pending_offset.is_some()));
        buf.put_u64_le(self.pending_offset.map_or(0, Offset::get));
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes the state.
    ///
    /// # Errors
    /// Returns `CorruptState` if the bytes fail any check.
    pub fn decode(data: &[u8]) -> PartitionResult<Self> {
        if data.len() != STATE_SIZE {
            return Err(PartitionError::CorruptState {
                reason: "eviction state has wrong size",
            });
        }
        let (body, mut crc_bytes) = data.split_at(STATE_SIZE - 4);
        if crc32fast::hash(body) != crc_bytes.get_u32_le() {
            return Err(PartitionError::CorruptState {
                reason: "eviction state checksum mismatch",
            });
        }
        let mut buf = body;
        if &buf[..8] != STATE_MAGIC {
            return Err(PartitionError::CorruptState {
                reason: "eviction state bad magic",
            });
        }
        buf.advance(8);
        if buf.get_u32_le() != STATE_VERSION {
            return Err(PartitionError::CorruptState {
                reason: "eviction state unsupported version",
            });
        }
        let last_applied_truncation_offset = Offset::new(buf.get_u64_le());
        let last_applied_index = LogIndex::new(buf.get_u64_le());
        let has_pending = buf.get_u8();
        let pending = Offset::new(buf.get_u64_le());
        let pending_offset = match has_pending {
            0 => None,
            1 => Some(pending),
            _ => {
                return Err(PartitionError::CorruptState {
                    reason: "eviction state bad pending flag",
                })
            }
        };
        Ok(Self {
            last_applied_truncation_offset,
            last_applied_index,
            pending_offset,
        })
    }
}

/// Eviction state plus the file it is persisted to.
///
/// Updates always land in memory; persistence may fail and is retried by
/// the next update.
pub struct EvictionStateStore {
    storage: Arc<dyn Storage>,
    path: PathBuf,
    current: Mutex<EvictionState>,
    /// Serializes writers so the newest state is also the last one written.
    persist: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for EvictionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionStateStore")
            .field("path", &self.path)
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl EvictionStateStore {
    /// Loads the state from `dir`, or starts empty if none was persisted.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub async fn load(storage: Arc<dyn Storage>, dir: &Path) -> PartitionResult<Self> {
        let path = dir.join(EVICTION_STATE_FILE_NAME);
        let state = if storage.exists(&path).await? {
            let data = storage.open(&path).await?.read_all().await?;
            EvictionState::decode(&data)?
        } else {
            EvictionState::default()
        };
        debug!(path = %path.display(), ?state, "Loaded eviction state");
        Ok(Self {
            storage,
            path,
            current: Mutex::new(state),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    /// Latest state, persisted or not.
    #[must_use]
    pub fn current(&self) -> EvictionState {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `update` in memory, then persists the result.
    ///
    /// # Errors
    /// Returns an error if persisting fails; the in-memory state is updated
    /// regardless.
    pub async fn update(&self, update: impl FnOnce(&mut EvictionState)) -> PartitionResult<()> {
        let _persist = self.persist.lock().await;
        let state = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut current);
            *current
        };
        write_atomic(self.storage.as_ref(), &self.path, &state.encode()).await?;
        Ok(())
    }

    /// Removes the persisted file.
    ///
    /// # Errors
    /// Returns an error if removal fails.
    pub async fn destroy(&self) -> PartitionResult<()> {
        self.storage.remove(&self.path).await?;
        Ok(())
    }
}
