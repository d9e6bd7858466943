//! Creation, elevation and termination of transactions.

use std::collections::HashSet;
use std::sync::Arc;

use si_metrics::{TXN_BEGUN_TOTAL, TXN_COMMITTED_TOTAL, TXN_ELEVATIONS_TOTAL, TXN_ROLLED_BACK_TOTAL};
use tracing::{debug, instrument};

use crate::config::TxnConfig;
use crate::gtm::TimestampSource;
use crate::store::TxnStore;
use crate::txn::{Destination, IsolationLevel, Outcome, TableId, Txn, TxnId, TxnState};
use crate::{Result, TxnError};

/// Creates root and child transactions and moves them through their lifecycle
/// against the transaction store.
///
/// Every operation is at least one round trip to the timestamp source or the
/// store and may fail with [`TxnError::StorageUnavailable`]. Nothing is retried
/// here.
pub struct TxnLifecycleManager {
    timestamps: Arc<dyn TimestampSource>,
    store: Arc<dyn TxnStore>,
    config: TxnConfig,
}

impl TxnLifecycleManager {
    /// Wire a manager to its timestamp source and transaction store.
    pub fn new(timestamps: Arc<dyn TimestampSource>, store: Arc<dyn TxnStore>, config: TxnConfig) -> Self {
        Self { timestamps, store, config }
    }

    /// Store backing this manager.
    pub fn store(&self) -> Arc<dyn TxnStore> {
        self.store.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Begin a read-only root transaction at the default isolation level.
    pub async fn begin_transaction(&self) -> Result<Txn> {
        self.begin_transaction_with(self.config.default_isolation).await
    }

    /// Begin a read-only root transaction.
    #[instrument(skip(self))]
    pub async fn begin_transaction_with(&self, isolation: IsolationLevel) -> Result<Txn> {
        // Ids come from the timestamp source, so id == begin timestamp.
        let ts = self.timestamps.next().await?;
        let txn = Txn::root(TxnId(ts), ts, isolation);
        self.store.create(txn.clone()).await?;
        TXN_BEGUN_TOTAL.inc();
        debug!(txn = %txn, "began root transaction");
        Ok(txn)
    }

    /// Begin a dependent child of `parent`. The child is writable for `table` only
    /// if the parent already is; otherwise it starts read-only and must be elevated.
    #[instrument(skip(self, parent), fields(parent = %parent.id))]
    pub async fn begin_child_transaction(
        &self,
        parent: &Txn,
        isolation: Option<IsolationLevel>,
        additive: bool,
        table: Option<TableId>,
    ) -> Result<Txn> {
        if parent.state.is_terminal() {
            return Err(TxnError::AlreadyTerminal { id: parent.id, state: parent.state });
        }
        // Readers refuse chains longer than this, so never create one.
        let max = self.config.max_ancestor_depth;
        if parent.depth >= max {
            return Err(TxnError::NestingTooDeep { parent: parent.id, max });
        }
        let ts = self.timestamps.next().await?;
        let destination = match table {
            Some(t) if parent.writable_for(&t) => Some(Destination::of(t)),
            _ => None,
        };
        let child = Txn::child(
            TxnId(ts),
            ts,
            parent,
            isolation.unwrap_or(parent.isolation),
            additive,
            destination,
        );
        self.store.create(child.clone()).await?;
        TXN_BEGUN_TOTAL.inc();
        debug!(txn = %child, "began child transaction");
        Ok(child)
    }

    /// Make `txn` writable for `table` and return the elevated value.
    ///
    /// A no-op if `txn` already covers `table`. Otherwise every ancestor that does
    /// not cover `table` is elevated first, outermost ancestor first, then `txn`.
    #[instrument(skip(self, txn), fields(txn = %txn.id))]
    pub async fn elevate_to_writable(&self, txn: &Txn, table: &TableId) -> Result<Txn> {
        if txn.writable_for(table) {
            return Ok(txn.clone());
        }
        if txn.state.is_terminal() {
            return Err(TxnError::AlreadyTerminal { id: txn.id, state: txn.state });
        }
        if let Some(parent) = txn.parent {
            let pending = self.unelevated_ancestors(parent, table).await?;
            for ancestor in pending.iter().rev() {
                self.record_destination(ancestor, table).await?;
            }
        }
        self.record_destination(txn, table).await
    }

    /// Elevate `txn` whose parent `elevated_parent` was just elevated for `table`,
    /// skipping the ancestry lookup.
    pub async fn elevate_under(&self, txn: &Txn, table: &TableId, elevated_parent: Option<&Txn>) -> Result<Txn> {
        if txn.writable_for(table) {
            return Ok(txn.clone());
        }
        match elevated_parent {
            Some(p) if txn.parent == Some(p.id) && p.writable_for(table) => {
                if txn.state.is_terminal() {
                    return Err(TxnError::AlreadyTerminal { id: txn.id, state: txn.state });
                }
                self.record_destination(txn, table).await
            }
            _ => self.elevate_to_writable(txn, table).await,
        }
    }

    /// Commit `txn` and return its commit timestamp.
    #[instrument(skip(self, txn), fields(txn = %txn.id))]
    pub async fn commit(&self, txn: &Txn) -> Result<u64> {
        if txn.state.is_terminal() {
            return Err(TxnError::AlreadyTerminal { id: txn.id, state: txn.state });
        }
        let commit_ts = self.timestamps.next().await?;
        let global_commit_ts = self.global_commit_timestamp(txn, commit_ts).await?;
        self.store
            .update_state(txn.id, Outcome::Committed { commit_ts, global_commit_ts })
            .await?;
        TXN_COMMITTED_TOTAL.inc();
        debug!(commit_ts, ?global_commit_ts, "committed");
        Ok(commit_ts)
    }

    /// Roll back `txn`. Rolling back an already rolled-back transaction is a no-op;
    /// rolling back a committed one fails.
    #[instrument(skip(self, txn), fields(txn = %txn.id))]
    pub async fn rollback(&self, txn: &Txn) -> Result<()> {
        match txn.state {
            TxnState::RolledBack => return Ok(()),
            TxnState::Committed => {
                return Err(TxnError::AlreadyTerminal { id: txn.id, state: txn.state });
            }
            TxnState::Active => {}
        }
        match self.store.update_state(txn.id, Outcome::RolledBack).await {
            Ok(_) => {
                TXN_ROLLED_BACK_TOTAL.inc();
                debug!("rolled back");
                Ok(())
            }
            Err(TxnError::AlreadyTerminal { state: TxnState::RolledBack, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn record_destination(&self, txn: &Txn, table: &TableId) -> Result<Txn> {
        let was_read_only = !txn.allows_writes();
        let elevated = self.store.record_destination(txn.id, table.clone()).await?;
        if was_read_only {
            TXN_ELEVATIONS_TOTAL.inc();
        }
        debug!(txn = %elevated, %table, "elevated");
        Ok(elevated)
    }

    /// Ancestors from `start` upwards that do not cover `table`, nearest first.
    async fn unelevated_ancestors(&self, start: TxnId, table: &TableId) -> Result<Vec<Txn>> {
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(start);
        while let Some(id) = next {
            if !seen.insert(id) || seen.len() > self.config.max_ancestor_depth {
                return Err(TxnError::MalformedAncestry(format!("cycle or excess depth at {id}")));
            }
            let txn = self.store.get(id).await?.ok_or(TxnError::NotFound(id))?;
            if txn.writable_for(table) {
                break;
            }
            next = txn.parent;
            pending.push(txn);
        }
        Ok(pending)
    }

    /// Commit timestamp of the outermost committed ancestor of the dependent chain,
    /// or `None` while some ancestor is still active or rolled back.
    async fn global_commit_timestamp(&self, txn: &Txn, commit_ts: u64) -> Result<Option<u64>> {
        if txn.is_root() || !txn.dependent {
            return Ok(Some(commit_ts));
        }
        let mut seen = HashSet::new();
        let mut next = txn.parent;
        while let Some(id) = next {
            if !seen.insert(id) || seen.len() > self.config.max_ancestor_depth {
                return Err(TxnError::MalformedAncestry(format!("cycle or excess depth at {id}")));
            }
            let parent = self.store.get(id).await?.ok_or(TxnError::NotFound(id))?;
            if parent.state != TxnState::Committed {
                return Ok(None);
            }
            if parent.is_root() || !parent.dependent {
                return Ok(parent.commit_timestamp);
            }
            next = parent.parent;
        }
        Ok(None)
    }
}
