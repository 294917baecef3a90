//! Storage abstraction for segment files, the manifest and partition state.
//!
//! The traits deal in raw bytes at offsets. Framing, checksums and the
//! meaning of each file belong to the callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{SegmentError, SegmentResult};

/// Storage backend.
///
/// Implementations must be `Send + Sync`; a single backend is shared by
/// every partition on a node.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens a file for read/write, creating it if missing.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> SegmentResult<Box<dyn StorageFile>>;

    /// Returns true if a file exists at `path`.
    ///
    /// # Errors
    /// Returns an error if existence cannot be determined.
    async fn exists(&self, path: &Path) -> SegmentResult<bool>;

    /// Lists files in `dir` with the given extension, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path, extension: &str) -> SegmentResult<Vec<PathBuf>>;

    /// Removes a file. Removing a file that does not exist succeeds.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be removed.
    async fn remove(&self, path: &Path) -> SegmentResult<()>;

    /// Atomically replaces `to` with `from`.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> SegmentResult<()>;

    /// Creates a directory and its parents.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> SegmentResult<()>;
}

/// An open file.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Writes `data` at `offset`.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn write_at(&self, offset: u64, data: &[u8]) -> SegmentResult<()>;

    /// Reads up to `len` bytes at `offset`; short at end of file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_at(&self, offset: u64, len: usize) -> SegmentResult<Bytes>;

    /// Reads the whole file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> SegmentResult<Bytes>;

    /// Flushes written data to stable storage.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync(&self) -> SegmentResult<()>;

    /// Returns the file size in bytes.
    ///
    /// # Errors
    /// Returns an error if the size cannot be determined.
    async fn size(&self) -> SegmentResult<u64>;

    /// Truncates the file to `len` bytes.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> SegmentResult<()>;
}

/// Writes `data` to `path` atomically: temp file, fsync, rename.
///
/// # Errors
/// Returns an error if any step fails. A failed rename leaves the previous
/// contents of `path` intact.
pub async fn write_atomic(storage: &dyn Storage, path: &Path, data: &[u8]) -> SegmentResult<()> {
    let temp_path = path.with_extension("tmp");
    // A stale temp file from an earlier crash must not leave trailing bytes.
    if storage.exists(&temp_path).await? {
        storage.remove(&temp_path).await?;
    }
    let file = storage.open(&temp_path).await?;
    file.write_at(0, data).await?;
    file.sync().await?;
    drop(file);
    storage.rename(&temp_path, path).await
}

// ----------------------------------------------------------------------------
// Tokio storage
// ----------------------------------------------------------------------------

/// Storage backed by `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new tokio storage backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> SegmentResult<Box<dyn StorageFile>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| SegmentError::io("open", e))?;

        Ok(Box::new(TokioFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn exists(&self, path: &Path) -> SegmentResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| SegmentError::io("exists", e))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> SegmentResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SegmentError::io("read_dir", e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SegmentError::io("read_dir_entry", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn remove(&self, path: &Path) -> SegmentResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SegmentError::io("remove", e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> SegmentResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| SegmentError::io("rename", e))
    }

    async fn create_dir_all(&self, path: &Path) -> SegmentResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SegmentError::io("create_dir_all", e))
    }
}

struct TokioFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)]
impl StorageFile for TokioFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> SegmentResult<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SegmentError::io("seek", e))?;
        file.write_all(data)
            .await
            .map_err(|e| SegmentError::io("write", e))?;
        file.flush().await.map_err(|e| SegmentError::io("flush", e))
    }

    async fn read_at(&self, offset: u64, len: usize) -> SegmentResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SegmentError::io("seek", e))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| SegmentError::io("read", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn read_all(&self) -> SegmentResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| SegmentError::io("seek", e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| SegmentError::io("read", e))?;
        Ok(Bytes::from(buf))
    }

    async fn sync(&self) -> SegmentResult<()> {
        let file = self.file.lock().await;
        file.sync_all().await.map_err(|e| SegmentError::io("sync", e))
    }

    async fn size(&self) -> SegmentResult<u64> {
        let file = self.file.lock().await;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| SegmentError::io("metadata", e))?;
        Ok(metadata.len())
    }

    async fn truncate(&self, len: u64) -> SegmentResult<()> {
        let file = self.file.lock().await;
        file.set_len(len)
            .await
            .map_err(|e| SegmentError::io("truncate", e))
    }
}

// ----------------------------------------------------------------------------
// Simulated storage
// ----------------------------------------------------------------------------

/// Fault injection switches for [`SimulatedStorage`].
#[derive(Debug, Clone, Default)]
pub struct StorageFaultConfig {
    /// Fail the next write.
    pub force_write_fail: bool,
    /// Fail the next fsync.
    pub force_sync_fail: bool,
    /// Let this many removals succeed, then fail every removal until cleared.
    pub fail_remove_after: Option<u32>,
    /// Fail every rename until cleared.
    pub fail_renames: bool,
}

impl StorageFaultConfig {
    /// No faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Fails removals once `successes` removals have gone through.
    #[must_use]
    pub const fn with_fail_remove_after(mut self, successes: u32) -> Self {
        self.fail_remove_after = Some(successes);
        self
    }

    /// Fails every rename.
    #[must_use]
    pub const fn with_fail_renames(mut self) -> Self {
        self.fail_renames = true;
        self
    }
}

type FileMap = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// In-memory storage with fault injection.
///
/// Clones share the same files, so a "restarted" component opened over a
/// clone sees exactly what the "crashed" one left behind.
#[derive(Debug, Clone, Default)]
#[allow(clippy::missing_panics_doc)]
pub struct SimulatedStorage {
    files: FileMap,
    faults: Arc<Mutex<StorageFaultConfig>>,
    removals: Arc<AtomicU32>,
}

#[allow(clippy::missing_panics_doc)]
impl SimulatedStorage {
    /// Creates an empty simulated storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a simulated storage with the given faults armed.
    #[must_use]
    pub fn with_faults(faults: StorageFaultConfig) -> Self {
        let storage = Self::default();
        *storage.fault_config() = faults;
        storage
    }

    /// Returns the fault configuration for modification.
    pub fn fault_config(&self) -> MutexGuard<'_, StorageFaultConfig> {
        self.faults.lock().expect("fault config lock poisoned")
    }

    /// Clears every armed fault.
    pub fn clear_faults(&self) {
        *self.fault_config() = StorageFaultConfig::none();
        self.removals.store(0, Ordering::SeqCst);
    }

    /// Returns true if a file exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.files().contains_key(path)
    }

    /// Lists every file under `dir` with the given extension, sorted.
    #[must_use]
    pub fn files_in(&self, dir: &Path, extension: &str) -> Vec<PathBuf> {
        let mut result: Vec<_> = self
            .files()
            .keys()
            .filter(|p| p.parent() == Some(dir) && p.extension().is_some_and(|e| e == extension))
            .cloned()
            .collect();
        result.sort();
        result
    }

    /// Returns the raw contents of a file.
    #[must_use]
    pub fn raw_content(&self, path: &Path) -> Option<Vec<u8>> {
        self.files().get(path).cloned()
    }

    /// Overwrites the raw contents of a file.
    pub fn set_raw_content(&self, path: &Path, content: Vec<u8>) {
        self.files().insert(path.to_path_buf(), content);
    }

    /// Chops a file to `len` bytes to simulate a torn write.
    pub fn truncate_file(&self, path: &Path, len: usize) {
        if let Some(content) = self.files().get_mut(path) {
            content.truncate(len);
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        self.files.lock().expect("files lock poisoned")
    }
}

#[async_trait]
impl Storage for SimulatedStorage {
    async fn open(&self, path: &Path) -> SegmentResult<Box<dyn StorageFile>> {
        self.files().entry(path.to_path_buf()).or_default();
        Ok(Box::new(SimulatedFile {
            path: path.to_path_buf(),
            files: Arc::clone(&self.files),
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn exists(&self, path: &Path) -> SegmentResult<bool> {
        Ok(self.contains(path))
    }

    async fn list_files(&self, dir: &Path, extension: &str) -> SegmentResult<Vec<PathBuf>> {
        Ok(self.files_in(dir, extension))
    }

    async fn remove(&self, path: &Path) -> SegmentResult<()> {
        if let Some(budget) = self.fault_config().fail_remove_after {
            if self.removals.load(Ordering::SeqCst) >= budget {
                return Err(SegmentError::io("remove", "simulated removal failure"));
            }
        }
        if self.files().remove(path).is_some() {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> SegmentResult<()> {
        if self.fault_config().fail_renames {
            return Err(SegmentError::io("rename", "simulated rename failure"));
        }
        let mut files = self.files();
        let content = files
            .remove(from)
            .ok_or_else(|| SegmentError::io("rename", "source not found"))?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> SegmentResult<()> {
        // Directories are implicit.
        Ok(())
    }
}

struct SimulatedFile {
    path: PathBuf,
    files: FileMap,
    faults: Arc<Mutex<StorageFaultConfig>>,
}

impl SimulatedFile {
    fn take_fault(&self, pick: impl FnOnce(&mut StorageFaultConfig) -> &mut bool) -> bool {
        let mut faults = self.faults.lock().expect("fault config lock poisoned");
        std::mem::take(pick(&mut faults))
    }
}

#[async_trait]
#[allow(clippy::significant_drop_tightening, clippy::cast_possible_truncation)]
impl StorageFile for SimulatedFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> SegmentResult<()> {
        if self.take_fault(|f| &mut f.force_write_fail) {
            return Err(SegmentError::io("write", "simulated write failure"));
        }
        let mut files = self.files.lock().expect("files lock poisoned");
        let content = files
            .get_mut(&self.path)
            .ok_or_else(|| SegmentError::io("write", "file removed"))?;
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: usize) -> SegmentResult<Bytes> {
        let files = self.files.lock().expect("files lock poisoned");
        let content = files
            .get(&self.path)
            .ok_or_else(|| SegmentError::io("read", "file not found"))?;
        let start = offset as usize;
        if start >= content.len() {
            return Ok(Bytes::new());
        }
        let end = content.len().min(start + len);
        Ok(Bytes::copy_from_slice(&content[start..end]))
    }

    async fn read_all(&self) -> SegmentResult<Bytes> {
        let files = self.files.lock().expect("files lock poisoned");
        let content = files
            .get(&self.path)
            .ok_or_else(|| SegmentError::io("read", "file not found"))?;
        Ok(Bytes::copy_from_slice(content))
    }

    async fn sync(&self) -> SegmentResult<()> {
        if self.take_fault(|f| &mut f.force_sync_fail) {
            return Err(SegmentError::io("sync", "simulated fsync failure"));
        }
        Ok(())
    }

    async fn size(&self) -> SegmentResult<u64> {
        let files = self.files.lock().expect("files lock poisoned");
        Ok(files.get(&self.path).map_or(0, |c| c.len() as u64))
    }

    async fn truncate(&self, len: u64) -> SegmentResult<()> {
        let mut files = self.files.lock().expect("files lock poisoned");
        if let Some(content) = files.get_mut(&self.path) {
            content.truncate(len as usize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_remove_is_idempotent() {
        let storage = SimulatedStorage::new();
        let path = PathBuf::from("/p/0.log");
        storage.open(&path).await.unwrap();
        storage.remove(&path).await.unwrap();
        storage.remove(&path).await.unwrap();
        assert!(!storage.contains(&path));
    }

    #[tokio::test]
    async fn test_simulated_remove_budget() {
        let storage =
            SimulatedStorage::with_faults(StorageFaultConfig::none().with_fail_remove_after(1));
        let a = PathBuf::from("/p/a.log");
        let b = PathBuf::from("/p/b.log");
        storage.open(&a).await.unwrap();
        storage.open(&b).await.unwrap();

        storage.remove(&a).await.unwrap();
        assert!(storage.remove(&b).await.is_err());
        assert!(storage.contains(&b));

        storage.clear_faults();
        storage.remove(&b).await.unwrap();
        assert!(storage.files_in(Path::new("/p"), "log").is_empty());
    }

    #[tokio::test]
    async fn test_write_atomic_keeps_old_contents_on_failed_rename() {
        let storage = SimulatedStorage::new();
        let path = PathBuf::from("/p/MANIFEST");
        write_atomic(&storage, &path, b"first").await.unwrap();

        storage.fault_config().fail_renames = true;
        assert!(write_atomic(&storage, &path, b"second").await.is_err());
        assert_eq!(storage.raw_content(&path).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_tokio_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TokioStorage::new();
        let path = dir.path().join("00000000000000000000.log");

        let file = storage.open(&path).await.unwrap();
        file.write_at(0, b"hello").await.unwrap();
        file.write_at(5, b" world").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(file.size().await.unwrap(), 11);
        assert_eq!(&file.read_at(6, 100).await.unwrap()[..], b"world");

        file.truncate(5).await.unwrap();
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello");

        let listed = storage.list_files(dir.path(), "log").await.unwrap();
        assert_eq!(listed, vec![path.clone()]);
        storage.remove(&path).await.unwrap();
        storage.remove(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
    }
}
