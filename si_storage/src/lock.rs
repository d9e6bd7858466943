use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::engine::{Result, StorageError};
use crate::WriterId;

/// Exclusive, non-blocking row locks keyed by row key.
#[derive(Default)]
pub struct RowLocks {
    table: Mutex<HashMap<Vec<u8>, WriterId>>, // row key -> owner
}

impl RowLocks {
    /// Take the lock on `key` for `owner`. Re-entrant for the current owner.
    /// Returns `false` if another owner holds it.
    pub fn try_lock(&self, key: &[u8], owner: WriterId) -> Result<bool> {
        let mut tbl = self.table()?;
        match tbl.get(key) {
            Some(&holder) => Ok(holder == owner),
            None => {
                tbl.insert(key.to_vec(), owner);
                Ok(true)
            }
        }
    }

    /// Release `key` if held by `owner`.
    pub fn unlock(&self, key: &[u8], owner: WriterId) -> Result<()> {
        let mut tbl = self.table()?;
        if tbl.get(key) == Some(&owner) {
            tbl.remove(key);
        }
        Ok(())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<Vec<u8>, WriterId>>> {
        self.table
            .lock()
            .map_err(|_| StorageError::Unavailable("lock table poisoned".into()))
    }
}
