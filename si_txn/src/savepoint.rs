//! Connection-level transaction with nested savepoints.
//!
//! Savepoints are a stack of child transactions over one root transaction, so a
//! partial rollback is visible to readers through transaction state alone.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::debug;

use crate::lifecycle::TxnLifecycleManager;
use crate::txn::{TableId, Txn};
use crate::{Result, TxnError};

/// Savepoint name that toggles savepoint suppression for batch statements.
pub const BATCH_SAVEPOINT: &str = "BATCH_SAVEPOINT";

/// Connection transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transaction begun yet, or the last one finished.
    Idle,
    /// A root transaction is on the stack.
    Active,
    /// Closed for good.
    Closed,
}

#[derive(Debug, Clone)]
struct Savepoint {
    name: String,
    txn: Txn,
}

/// The logical transaction of one connection.
///
/// Owned by exactly one connection; `&mut self` serializes every operation.
/// Index 0 of the stack is the bottom (root) entry, the last entry is the
/// current leaf that statements run under.
pub struct ConnectionTxn {
    lifecycle: Arc<TxnLifecycleManager>,
    name: String,
    state: ConnectionState,
    stack: Vec<Savepoint>,
    ignore_savepoints: bool,
}

impl ConnectionTxn {
    /// Idle connection transaction. `name` labels the bottom stack entry.
    pub fn new(lifecycle: Arc<TxnLifecycleManager>, name: impl Into<String>) -> Self {
        let ignore_savepoints = lifecycle.config().ignore_savepoints;
        Self {
            lifecycle,
            name: name.into(),
            state: ConnectionState::Idle,
            stack: Vec::new(),
            ignore_savepoints,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of stack entries, root included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Toggle savepoint suppression.
    pub fn set_ignore_savepoints(&mut self, ignore: bool) {
        self.ignore_savepoints = ignore;
    }

    /// Leaf transaction, if active.
    pub fn current_txn(&self) -> Option<&Txn> {
        self.stack.last().map(|s| &s.txn)
    }

    /// Bottom transaction, if active.
    pub fn root_txn(&self) -> Option<&Txn> {
        self.stack.first().map(|s| &s.txn)
    }

    /// True if the leaf may write.
    pub fn allows_writes(&self) -> bool {
        self.current_txn().is_some_and(Txn::allows_writes)
    }

    /// Leaf transaction for the next statement, beginning a root transaction if idle.
    pub async fn active_txn(&mut self) -> Result<Txn> {
        self.ensure_active().await?;
        self.leaf()
    }

    /// Activate as a child of an outer transaction instead of a fresh root.
    /// No-op unless idle.
    pub async fn activate_nested(&mut self, parent: &Txn, additive: bool, table: Option<TableId>) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(TxnError::TransactionClosed),
            ConnectionState::Active => Ok(()),
            ConnectionState::Idle => {
                let txn = self
                    .lifecycle
                    .begin_child_transaction(parent, Some(parent.isolation), additive, table)
                    .await?;
                self.push(self.name.clone(), txn);
                self.state = ConnectionState::Active;
                Ok(())
            }
        }
    }

    /// Push a savepoint named `name` and return the new stack depth.
    pub async fn set_savepoint(&mut self, name: &str) -> Result<usize> {
        if self.ignore_savepoints {
            return Ok(1);
        }
        if name == BATCH_SAVEPOINT {
            self.ignore_savepoints = true;
        }
        self.trace("before set_savepoint", name);
        self.ensure_active().await?;
        let parent = self.leaf()?;
        let child = self.lifecycle.begin_child_transaction(&parent, None, false, None).await?;
        self.push(name.to_string(), child);
        self.trace("after set_savepoint", name);
        Ok(self.stack.len())
    }

    /// Commit and pop every entry from the top down to and including the nearest
    /// savepoint named `name`. Returns the remaining depth.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<usize> {
        if name == BATCH_SAVEPOINT {
            self.ignore_savepoints = false;
        }
        if self.ignore_savepoints {
            return Ok(0);
        }
        self.trace("before release_savepoint", name);
        let target = self.find(name)?;
        // Popped children commit one by one; visibility still waits on the root.
        // An entry leaves the stack only after its commit is stored, so a failed
        // release can be retried.
        while self.stack.len() > target {
            let top = self.leaf()?;
            self.lifecycle.commit(&top).await?;
            self.stack.pop();
        }
        self.settle();
        self.trace("after release_savepoint", name);
        Ok(self.stack.len())
    }

    /// Roll back and pop every entry from the top down to and including the nearest
    /// savepoint named `name`, then push a fresh savepoint with the same name.
    /// Returns the resulting depth.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<usize> {
        if self.ignore_savepoints {
            return Ok(0);
        }
        self.trace("before rollback_to_savepoint", name);
        let target = self.find(name)?;
        // Every popped entry is marked, not only the target, and leaves the
        // stack only once its rollback is stored.
        while self.stack.len() > target {
            let top = self.leaf()?;
            self.lifecycle.rollback(&top).await?;
            self.stack.pop();
        }
        self.settle();
        let depth = self.set_savepoint(name).await?;
        self.trace("after rollback_to_savepoint", name);
        Ok(depth)
    }

    /// Commit the whole connection transaction.
    ///
    /// Idle connections succeed with no timestamp. Only the bottom entry is
    /// committed; that finalizes every savepoint above it.
    pub async fn commit(&mut self) -> Result<Option<u64>> {
        self.trace("before commit", "");
        match self.state {
            ConnectionState::Idle => {
                debug!(connection = %self.name, "nothing to commit");
                return Ok(None);
            }
            ConnectionState::Closed => return Err(TxnError::TransactionClosed),
            ConnectionState::Active => {}
        }
        let root = match self.stack.first() {
            Some(savepoint) => savepoint.txn.clone(),
            None => {
                self.state = ConnectionState::Idle;
                return Ok(None);
            }
        };
        let commit_ts = self.lifecycle.commit(&root).await?;
        self.stack.clear();
        self.state = ConnectionState::Idle;
        self.trace("after commit", "");
        Ok(Some(commit_ts))
    }

    /// Roll back every entry, top first. No-op unless active.
    pub async fn abort(&mut self) -> Result<()> {
        self.trace("before abort", "");
        if self.state != ConnectionState::Active {
            return Ok(());
        }
        while let Some(top) = self.current_txn().cloned() {
            self.lifecycle.rollback(&top).await?;
            self.stack.pop();
        }
        self.state = ConnectionState::Idle;
        self.trace("after abort", "");
        Ok(())
    }

    /// Abort anything in flight and refuse further work.
    pub async fn close(&mut self) -> Result<()> {
        self.abort().await?;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Make the leaf writable for `table`, elevating every stack entry from the
    /// bottom up so each parent is writable before its child. Each elevated value
    /// replaces its entry in place. Returns the new leaf.
    pub async fn elevate(&mut self, table: &TableId) -> Result<Txn> {
        self.trace("before elevate", &table.0);
        self.ensure_active().await?;
        let mut parent: Option<Txn> = None;
        for savepoint in self.stack.iter_mut() {
            let elevated = self
                .lifecycle
                .elevate_under(&savepoint.txn, table, parent.as_ref())
                .await?;
            savepoint.txn = elevated.clone();
            parent = Some(elevated);
        }
        self.trace("after elevate", &table.0);
        self.leaf()
    }

    async fn ensure_active(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(TxnError::TransactionClosed),
            ConnectionState::Active => Ok(()),
            ConnectionState::Idle => {
                let txn = self.lifecycle.begin_transaction().await?;
                self.push(self.name.clone(), txn);
                self.state = ConnectionState::Active;
                Ok(())
            }
        }
    }

    fn push(&mut self, name: String, txn: Txn) {
        self.stack.push(Savepoint { name, txn });
    }

    fn leaf(&self) -> Result<Txn> {
        self.current_txn().cloned().ok_or(TxnError::TransactionClosed)
    }

    /// Index of the nearest entry named `name`.
    fn find(&self, name: &str) -> Result<usize> {
        if self.state == ConnectionState::Closed {
            return Err(TxnError::TransactionClosed);
        }
        self.stack
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()))
    }

    /// An emptied stack means the connection transaction is over.
    fn settle(&mut self) {
        if self.stack.is_empty() && self.state == ConnectionState::Active {
            self.state = ConnectionState::Idle;
        }
    }

    fn trace(&self, op: &str, name: &str) {
        debug!(connection = %self.name, op, savepoint = name, state = ?self.state, stack = %self.stack_string());
    }

    /// One line per entry, top of the stack first.
    fn stack_string(&self) -> String {
        let mut out = String::new();
        for savepoint in self.stack.iter().rev() {
            let _ = write!(out, "name={}, txn={}; ", savepoint.name, savepoint.txn);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::gtm::Gtm;
    use crate::store::{MemTxnStore, TxnStore};
    use crate::txn::{TxnId, TxnState};

    fn connection_with(config: TxnConfig) -> (ConnectionTxn, Arc<MemTxnStore>) {
        let store = Arc::new(MemTxnStore::new());
        let lifecycle = Arc::new(TxnLifecycleManager::new(Arc::new(Gtm::default()), store.clone(), config));
        (ConnectionTxn::new(lifecycle, "user"), store)
    }

    fn connection() -> (ConnectionTxn, Arc<MemTxnStore>) {
        connection_with(TxnConfig::default())
    }

    async fn state_of(store: &MemTxnStore, id: TxnId) -> TxnState {
        store.get(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn first_savepoint_activates_connection() {
        let (mut conn, _) = connection();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.set_savepoint("sp1").await.unwrap(), 2);
        assert_eq!(conn.state(), ConnectionState::Active);
        let root = conn.root_txn().unwrap().clone();
        assert_eq!(conn.current_txn().unwrap().parent, Some(root.id));
    }

    #[tokio::test]
    async fn release_commits_popped_entries_only() {
        let (mut conn, store) = connection();
        conn.set_savepoint("a").await.unwrap();
        let a = conn.current_txn().unwrap().id;
        conn.set_savepoint("b").await.unwrap();
        let b = conn.current_txn().unwrap().id;
        conn.set_savepoint("c").await.unwrap();
        let c = conn.current_txn().unwrap().id;

        assert_eq!(conn.release_savepoint("b").await.unwrap(), 2);
        assert_eq!(state_of(&store, c).await, TxnState::Committed);
        assert_eq!(state_of(&store, b).await, TxnState::Committed);
        assert_eq!(state_of(&store, a).await, TxnState::Active);
        assert_eq!(conn.current_txn().unwrap().id, a);
    }

    #[tokio::test]
    async fn release_targets_nearest_duplicate_name() {
        let (mut conn, _) = connection();
        conn.set_savepoint("x").await.unwrap();
        conn.set_savepoint("x").await.unwrap();
        assert_eq!(conn.release_savepoint("x").await.unwrap(), 2);
        assert_eq!(conn.release_savepoint("x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_savepoint_is_an_error() {
        let (mut conn, _) = connection();
        assert!(matches!(
            conn.release_savepoint("nope").await,
            Err(TxnError::SavepointNotFound(n)) if n == "nope"
        ));
        conn.set_savepoint("sp").await.unwrap();
        assert!(matches!(conn.rollback_to_savepoint("nope").await, Err(TxnError::SavepointNotFound(_))));
        assert_eq!(conn.depth(), 2);
    }

    #[tokio::test]
    async fn rollback_to_reestablishes_savepoint() {
        let (mut conn, store) = connection();
        conn.set_savepoint("sp1").await.unwrap();
        let old = conn.current_txn().unwrap().id;
        conn.set_savepoint("sp2").await.unwrap();
        let inner = conn.current_txn().unwrap().id;

        assert_eq!(conn.rollback_to_savepoint("sp1").await.unwrap(), 2);
        assert_eq!(state_of(&store, old).await, TxnState::RolledBack);
        assert_eq!(state_of(&store, inner).await, TxnState::RolledBack);
        let fresh = conn.current_txn().unwrap();
        assert_ne!(fresh.id, old);
        assert_eq!(fresh.state, TxnState::Active);
        // The fresh savepoint answers to the same name.
        assert_eq!(conn.release_savepoint("sp1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commit_finalizes_root_and_resets() {
        let (mut conn, store) = connection();
        conn.set_savepoint("sp").await.unwrap();
        let root = conn.root_txn().unwrap().id;
        let child = conn.current_txn().unwrap().id;
        let ts = conn.commit().await.unwrap();
        assert!(ts.is_some());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.depth(), 0);
        assert_eq!(state_of(&store, root).await, TxnState::Committed);
        // The child is left to the root's commit.
        assert_eq!(state_of(&store, child).await, TxnState::Active);
    }

    #[tokio::test]
    async fn idle_commit_and_abort_are_quiet() {
        let (mut conn, store) = connection();
        assert_eq!(conn.commit().await.unwrap(), None);
        conn.abort().await.unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn abort_rolls_back_every_entry() {
        let (mut conn, store) = connection();
        conn.set_savepoint("a").await.unwrap();
        conn.set_savepoint("b").await.unwrap();
        let ids: Vec<_> = conn.stack.iter().map(|s| s.txn.id).collect();
        conn.abort().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        for id in ids {
            assert_eq!(state_of(&store, id).await, TxnState::RolledBack);
        }
    }

    #[tokio::test]
    async fn closed_connection_refuses_work() {
        let (mut conn, _) = connection();
        conn.active_txn().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.commit().await, Err(TxnError::TransactionClosed)));
        assert!(matches!(conn.set_savepoint("sp").await, Err(TxnError::TransactionClosed)));
        assert!(matches!(conn.release_savepoint("sp").await, Err(TxnError::TransactionClosed)));
        conn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn elevate_walks_stack_bottom_up() {
        let (mut conn, store) = connection();
        conn.set_savepoint("a").await.unwrap();
        conn.set_savepoint("b").await.unwrap();
        let table = TableId::new("t");
        let leaf = conn.elevate(&table).await.unwrap();
        assert!(leaf.writable_for(&table));
        assert!(conn.allows_writes());
        for savepoint in &conn.stack {
            assert!(savepoint.txn.writable_for(&table));
            assert!(store.get(savepoint.txn.id).await.unwrap().unwrap().writable_for(&table));
        }
        let again = conn.elevate(&table).await.unwrap();
        assert_eq!(again, leaf);
    }

    #[tokio::test]
    async fn batch_savepoint_suppresses_nested_savepoints() {
        let (mut conn, _) = connection();
        assert_eq!(conn.set_savepoint(BATCH_SAVEPOINT).await.unwrap(), 2);
        assert_eq!(conn.set_savepoint("stmt").await.unwrap(), 1);
        assert_eq!(conn.rollback_to_savepoint("stmt").await.unwrap(), 0);
        assert_eq!(conn.release_savepoint("stmt").await.unwrap(), 0);
        assert_eq!(conn.depth(), 2);
        assert_eq!(conn.release_savepoint(BATCH_SAVEPOINT).await.unwrap(), 1);
        assert_eq!(conn.set_savepoint("stmt").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn configured_suppression_returns_constant_depth() {
        let (mut conn, store) = connection_with(TxnConfig { ignore_savepoints: true, ..TxnConfig::default() });
        assert_eq!(conn.set_savepoint("sp").await.unwrap(), 1);
        assert!(store.is_empty().unwrap());
        conn.set_ignore_savepoints(false);
        assert_eq!(conn.set_savepoint("sp").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn nested_activation_parents_bottom_entry() {
        let (mut conn, _) = connection();
        let outer = conn.lifecycle.begin_transaction().await.unwrap();
        conn.activate_nested(&outer, true, None).await.unwrap();
        let bottom = conn.root_txn().unwrap();
        assert_eq!(bottom.parent, Some(outer.id));
        assert!(bottom.additive);
        assert_eq!(conn.depth(), 1);
    }

    #[tokio::test]
    async fn store_outage_surfaces_from_savepoint_ops() {
        let (mut conn, store) = connection();
        conn.set_savepoint("sp").await.unwrap();
        store.set_available(false);
        assert!(matches!(conn.set_savepoint("sp2").await, Err(TxnError::StorageUnavailable(_))));
        assert!(matches!(conn.commit().await, Err(TxnError::StorageUnavailable(_))));
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn failed_rollback_to_leaves_stack_retryable() {
        let (mut conn, store) = connection();
        conn.set_savepoint("sp").await.unwrap();
        let undone = conn.current_txn().unwrap().id;
        store.set_available(false);
        assert!(matches!(conn.rollback_to_savepoint("sp").await, Err(TxnError::StorageUnavailable(_))));
        assert_eq!(conn.depth(), 2);
        assert_eq!(conn.current_txn().unwrap().id, undone);

        store.set_available(true);
        assert_eq!(conn.rollback_to_savepoint("sp").await.unwrap(), 2);
        assert_eq!(state_of(&store, undone).await, TxnState::RolledBack);
        assert_ne!(conn.current_txn().unwrap().id, undone);
    }

    #[tokio::test]
    async fn failed_release_leaves_stack_retryable() {
        let (mut conn, store) = connection();
        conn.set_savepoint("a").await.unwrap();
        conn.set_savepoint("b").await.unwrap();
        let b = conn.current_txn().unwrap().id;
        store.set_available(false);
        assert!(matches!(conn.release_savepoint("a").await, Err(TxnError::StorageUnavailable(_))));
        assert_eq!(conn.depth(), 3);

        store.set_available(true);
        assert_eq!(conn.release_savepoint("a").await.unwrap(), 1);
        assert_eq!(state_of(&store, b).await, TxnState::Committed);
    }

    #[tokio::test]
    async fn failed_abort_can_be_retried() {
        let (mut conn, store) = connection();
        conn.set_savepoint("a").await.unwrap();
        let ids: Vec<_> = conn.stack.iter().map(|s| s.txn.id).collect();
        store.set_available(false);
        assert!(conn.abort().await.is_err());
        assert_eq!(conn.depth(), 2);
        assert_eq!(conn.state(), ConnectionState::Active);

        store.set_available(true);
        conn.abort().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        for id in ids {
            assert_eq!(state_of(&store, id).await, TxnState::RolledBack);
        }
    }

    #[tokio::test]
    async fn savepoints_nest_up_to_the_ancestor_limit() {
        let (mut conn, _) = connection_with(TxnConfig { max_ancestor_depth: 4, ..TxnConfig::default() });
        for n in 0..4 {
            assert_eq!(conn.set_savepoint(&format!("sp{n}")).await.unwrap(), n + 2);
        }
        assert_eq!(conn.current_txn().unwrap().depth, 4);
        assert!(matches!(
            conn.set_savepoint("one_too_many").await,
            Err(TxnError::NestingTooDeep { max: 4, .. })
        ));
        assert_eq!(conn.depth(), 5);
        assert!(conn.commit().await.unwrap().is_some());
    }
}
