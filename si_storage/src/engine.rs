use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::lock::RowLocks;
use crate::{Resolution, RowVersion, WriterId};

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store cannot be reached right now.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage adapter contract consumed by the transaction core.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Append a new version of `key` tagged with `writer`. `None` writes a tombstone.
    async fn put(&self, key: &[u8], value: Option<Vec<u8>>, writer: WriterId) -> Result<()>;

    /// All versions of `key`, newest first.
    async fn get(&self, key: &[u8]) -> Result<Vec<RowVersion>>;

    /// Versions of every key in `[start, end)`, keys ascending, newest first per key.
    /// An `end` of `None` scans to the end of the keyspace.
    async fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<RowVersion>>;

    /// Try to take the row lock on `key` for `owner` without waiting.
    async fn try_lock(&self, key: &[u8], owner: WriterId) -> Result<bool>;

    /// Release the row lock on `key` if `owner` holds it.
    async fn unlock(&self, key: &[u8], owner: WriterId) -> Result<()>;

    /// Attach a resolution marker to the version of `key` written by `writer`.
    /// Never alters the value or writer of an existing version.
    async fn background_write(&self, key: &[u8], writer: WriterId, resolution: Resolution) -> Result<()>;
}

/// In-memory sorted multi-version store.
#[derive(Default, Clone)]
pub struct MemKvStore {
    rows: Arc<Mutex<BTreeMap<Vec<u8>, Vec<RowVersion>>>>,
    locks: Arc<RowLocks>,
    unavailable: Arc<AtomicBool>,
}

impl MemKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability. While unavailable every call fails with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Store a raw version as-is (foreign writes, restores).
    pub fn insert_raw(&self, version: RowVersion) -> Result<()> {
        self.check()?;
        let mut rows = self.rows()?;
        rows.entry(version.key.clone()).or_default().insert(0, version);
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<Vec<u8>, Vec<RowVersion>>>> {
        self.rows
            .lock()
            .map_err(|_| StorageError::Unavailable("row map poisoned".into()))
    }
}

#[async_trait::async_trait]
impl KvStore for MemKvStore {
    async fn put(&self, key: &[u8], value: Option<Vec<u8>>, writer: WriterId) -> Result<()> {
        self.insert_raw(RowVersion::new(key, value, writer))
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<RowVersion>> {
        self.check()?;
        Ok(self.rows()?.get(key).cloned().unwrap_or_default())
    }

    async fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<RowVersion>> {
        self.check()?;
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        let rows = self.rows()?;
        Ok(rows
            .range((Bound::Included(start.to_vec()), upper))
            .flat_map(|(_, versions)| versions.iter().cloned())
            .collect())
    }

    async fn try_lock(&self, key: &[u8], owner: WriterId) -> Result<bool> {
        self.check()?;
        self.locks.try_lock(key, owner)
    }

    async fn unlock(&self, key: &[u8], owner: WriterId) -> Result<()> {
        self.check()?;
        self.locks.unlock(key, owner)
    }

    async fn background_write(&self, key: &[u8], writer: WriterId, resolution: Resolution) -> Result<()> {
        self.check()?;
        let mut rows = self.rows()?;
        if let Some(versions) = rows.get_mut(key) {
            for v in versions.iter_mut().filter(|v| v.writer == Some(writer)) {
                v.resolution = Some(resolution);
            }
        }
        trace!(writer, ?resolution, "resolution stored");
        Ok(())
    }
}
