use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::txn::{Destination, Outcome, TableId, Txn, TxnId, TxnState};
use crate::{Result, TxnError};

/// Durable mapping from transaction id to persisted transaction state.
///
/// The transaction core is the only writer of a record after `create`. Every
/// state change is atomic per id: exactly one terminal outcome can ever win.
#[async_trait::async_trait]
pub trait TxnStore: Send + Sync {
    /// Fetch a transaction, `None` if the id is unknown.
    async fn get(&self, id: TxnId) -> Result<Option<Txn>>;

    /// Persist a new transaction.
    async fn create(&self, txn: Txn) -> Result<()>;

    /// Move an active transaction to a terminal state and return the new record.
    /// Fails with [`TxnError::AlreadyTerminal`] if the record is already terminal.
    async fn update_state(&self, id: TxnId, outcome: Outcome) -> Result<Txn>;

    /// Add `table` to the transaction's write destination and return the new record.
    async fn record_destination(&self, id: TxnId, table: TableId) -> Result<Txn>;
}

/// In-memory transaction store.
#[derive(Default)]
pub struct MemTxnStore {
    txns: Mutex<HashMap<TxnId, Txn>>,
    unavailable: AtomicBool,
}

impl MemTxnStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability. While unavailable every call fails with
    /// [`TxnError::StorageUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Insert or overwrite a record without any checks (restores, fixtures).
    pub fn put_raw(&self, txn: Txn) -> Result<()> {
        self.txns()?.insert(txn.id, txn);
        Ok(())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.txns()?.len())
    }

    /// True if no transaction was ever stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn txns(&self) -> Result<MutexGuard<'_, HashMap<TxnId, Txn>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TxnError::StorageUnavailable("transaction store switched off".into()));
        }
        self.txns
            .lock()
            .map_err(|_| TxnError::StorageUnavailable("transaction map poisoned".into()))
    }
}

#[async_trait::async_trait]
impl TxnStore for MemTxnStore {
    async fn get(&self, id: TxnId) -> Result<Option<Txn>> {
        Ok(self.txns()?.get(&id).cloned())
    }

    async fn create(&self, txn: Txn) -> Result<()> {
        let mut txns = self.txns()?;
        if txns.contains_key(&txn.id) {
            return Err(TxnError::AlreadyExists(txn.id));
        }
        txns.insert(txn.id, txn);
        Ok(())
    }

    async fn update_state(&self, id: TxnId, outcome: Outcome) -> Result<Txn> {
        let mut txns = self.txns()?;
        let txn = txns.get_mut(&id).ok_or(TxnError::NotFound(id))?;
        if txn.state.is_terminal() {
            return Err(TxnError::AlreadyTerminal { id, state: txn.state });
        }
        match outcome {
            Outcome::Committed { commit_ts, global_commit_ts } => {
                txn.state = TxnState::Committed;
                txn.commit_timestamp = Some(commit_ts);
                txn.global_commit_timestamp = global_commit_ts;
            }
            Outcome::RolledBack => {
                txn.state = TxnState::RolledBack;
                txn.commit_timestamp = None;
                txn.global_commit_timestamp = None;
            }
        }
        Ok(txn.clone())
    }

    async fn record_destination(&self, id: TxnId, table: TableId) -> Result<Txn> {
        let mut txns = self.txns()?;
        let txn = txns.get_mut(&id).ok_or(TxnError::NotFound(id))?;
        if txn.state.is_terminal() {
            return Err(TxnError::AlreadyTerminal { id, state: txn.state });
        }
        match txn.destination.as_mut() {
            Some(dest) => {
                dest.insert(table);
            }
            None => txn.destination = Some(Destination::of(table)),
        }
        Ok(txn.clone())
    }
}
