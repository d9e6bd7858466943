//! sidb storage adapter: a sorted multi-version key-value contract.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// Key-value store contract and the in-memory store.
pub mod engine;
/// Per-row write locks.
pub mod lock;

pub use engine::{KvStore, MemKvStore, Result, StorageError};
pub use lock::RowLocks;

/// Identifier of the transaction that wrote a row version.
pub type WriterId = u64;

/// Terminal outcome of a writer, cached on the version by read resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Resolution {
    /// Writer is effectively committed at `commit_ts`.
    Committed {
        /// Effective commit timestamp of the writer.
        commit_ts: u64,
    },
    /// Writer is effectively rolled back.
    RolledBack,
}

/// One immutable version of a row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowVersion {
    /// Row key.
    pub key: Vec<u8>,
    /// Writer transaction id. `None` for foreign or corrupt writes.
    pub writer: Option<WriterId>,
    /// Payload. `None` marks a delete (tombstone).
    pub value: Option<Vec<u8>>,
    /// Cached outcome of the writer, if it has been resolved.
    pub resolution: Option<Resolution>,
}

impl RowVersion {
    /// Build an unresolved version written by `writer`.
    pub fn new(key: impl Into<Vec<u8>>, value: Option<Vec<u8>>, writer: WriterId) -> Self {
        Self {
            key: key.into(),
            writer: Some(writer),
            value,
            resolution: None,
        }
    }

    /// True if this version deletes the row.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_version_is_unresolved() {
        let v = RowVersion::new(b"k".to_vec(), Some(b"v".to_vec()), 7);
        assert_eq!(v.writer, Some(7));
        assert!(v.resolution.is_none());
        assert!(!v.is_tombstone());
        assert!(RowVersion::new(b"k".to_vec(), None, 7).is_tombstone());
    }
}
