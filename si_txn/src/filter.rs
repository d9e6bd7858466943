//! Snapshot visibility of row versions.
//!
//! A [`TxnFilter`] is built once per scan for a fixed reader transaction and
//! classifies every row version it is handed as [`FilterDecision::Include`] or
//! [`FilterDecision::Skip`]. Writers whose outcome is newly found to be terminal
//! are reported to the [`ReadResolver`] so later reads can use the cached marker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use si_metrics::UNRESOLVABLE_WRITERS_TOTAL;
use si_storage::{KvStore, Resolution, RowVersion};
use tracing::{trace, warn};

use crate::resolver::ReadResolver;
use crate::store::TxnStore;
use crate::txn::{IsolationLevel, Txn, TxnId, TxnState};
use crate::{Result, TxnError};

/// Result of classifying one row version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Visible to the reader.
    Include,
    /// Not visible to the reader.
    Skip,
}

/// State of a transaction after applying dependent-rollback propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveState {
    /// Outcome not final yet.
    Active,
    /// Final, visible to snapshots at or after `commit_ts`.
    Committed {
        /// Commit timestamp of the outermost committed ancestor.
        commit_ts: u64,
    },
    /// Final, never visible.
    RolledBack,
}

/// Effective state of the first transaction in `chain`, where `chain` holds a
/// transaction followed by its ancestors, nearest first.
///
/// A rolled-back node anywhere on the dependent part of the chain wins. Otherwise
/// the outermost node of the dependent chain decides: a committed ancestor
/// finalizes its descendants even if they are still recorded as active.
pub fn effective_state(chain: &[Txn]) -> Result<EffectiveState> {
    for txn in chain {
        if txn.state == TxnState::RolledBack {
            return Ok(EffectiveState::RolledBack);
        }
        if txn.is_root() || !txn.dependent {
            return match (txn.state, txn.commit_timestamp) {
                (TxnState::Committed, Some(commit_ts)) => Ok(EffectiveState::Committed { commit_ts }),
                (TxnState::Committed, None) => Err(TxnError::UnresolvableWriter(format!(
                    "transaction {} committed without a timestamp",
                    txn.id
                ))),
                _ => Ok(EffectiveState::Active),
            };
        }
    }
    Err(TxnError::UnresolvableWriter("ancestry chain ends before its root".into()))
}

/// Per-scan visibility filter for one reader.
pub struct TxnFilter {
    store: Arc<dyn TxnStore>,
    reader: Txn,
    /// Reader's strict ancestors, nearest first.
    reader_ancestors: Vec<Txn>,
    resolver: Option<Arc<dyn ReadResolver>>,
    /// Terminal transactions seen during this scan; their records never change.
    cache: HashMap<TxnId, Txn>,
    max_depth: usize,
}

impl TxnFilter {
    /// Build a filter for `reader`. The reader's ancestry is loaded once here and
    /// held fixed for the life of the filter.
    pub async fn new(
        store: Arc<dyn TxnStore>,
        reader: Txn,
        resolver: Option<Arc<dyn ReadResolver>>,
        max_depth: usize,
    ) -> Result<Self> {
        let mut filter = Self {
            store,
            reader_ancestors: Vec::new(),
            reader: reader.clone(),
            resolver,
            cache: HashMap::new(),
            max_depth,
        };
        let mut chain = match filter.chain_of(reader).await {
            Ok(chain) => chain,
            Err(TxnError::UnresolvableWriter(reason)) => return Err(TxnError::MalformedAncestry(reason)),
            Err(e) => return Err(e),
        };
        chain.remove(0);
        filter.reader_ancestors = chain;
        Ok(filter)
    }

    /// Reader this filter evaluates for.
    pub fn reader(&self) -> &Txn {
        &self.reader
    }

    /// Classify one row version.
    ///
    /// Storage failures are returned; versions whose writer cannot be resolved are
    /// logged and skipped.
    pub async fn classify(&mut self, version: &RowVersion) -> Result<FilterDecision> {
        let Some(writer) = version.writer.map(TxnId) else {
            return Ok(self.unresolvable(version, "version carries no writer id"));
        };
        if writer == self.reader.id {
            return Ok(FilterDecision::Include);
        }
        if let Some(ancestor) = self.reader_ancestors.iter().find(|a| a.id == writer) {
            return Ok(if ancestor.state == TxnState::RolledBack {
                FilterDecision::Skip
            } else {
                FilterDecision::Include
            });
        }
        if let Some(resolution) = version.resolution {
            trace!(%writer, ?resolution, "using cached resolution");
            return Ok(match resolution {
                Resolution::RolledBack => FilterDecision::Skip,
                Resolution::Committed { commit_ts } => self.committed_visibility(commit_ts),
            });
        }

        let chain = match self.writer_chain(writer).await {
            Ok(chain) => chain,
            Err(TxnError::UnresolvableWriter(reason)) => return Ok(self.unresolvable(version, &reason)),
            Err(e) => return Err(e),
        };
        if let Some(decision) = self.family_visibility(&chain) {
            return Ok(decision);
        }
        let state = match effective_state(&chain) {
            Ok(state) => state,
            Err(TxnError::UnresolvableWriter(reason)) => return Ok(self.unresolvable(version, &reason)),
            Err(e) => return Err(e),
        };
        Ok(match state {
            EffectiveState::RolledBack => {
                self.notify(version, Resolution::RolledBack);
                FilterDecision::Skip
            }
            EffectiveState::Active => match self.reader.isolation {
                IsolationLevel::ReadUncommitted => FilterDecision::Include,
                _ => FilterDecision::Skip,
            },
            EffectiveState::Committed { commit_ts } => {
                let decision = self.committed_visibility(commit_ts);
                if decision == FilterDecision::Include {
                    self.notify(version, Resolution::Committed { commit_ts });
                }
                decision
            }
        })
    }

    /// Effective state of `id` as seen through this filter's store.
    pub async fn effective_state_of(&mut self, id: TxnId) -> Result<EffectiveState> {
        let chain = self.writer_chain(id).await?;
        effective_state(&chain)
    }

    /// Newest visible value of `key`. A visible tombstone reads as absent.
    pub async fn read(&mut self, kv: &dyn KvStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for version in kv.get(key).await? {
            if self.classify(&version).await? == FilterDecision::Include {
                return Ok(version.value);
            }
        }
        Ok(None)
    }

    /// Newest visible value of every key in `[start, end)`, keys ascending.
    pub async fn scan(&mut self, kv: &dyn KvStore, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        let mut decided: Option<Vec<u8>> = None;
        for version in kv.scan(start, end).await? {
            if decided.as_deref() == Some(version.key.as_slice()) {
                continue;
            }
            if self.classify(&version).await? == FilterDecision::Include {
                decided = Some(version.key.clone());
                if let Some(value) = version.value {
                    rows.push((version.key, value));
                }
            }
        }
        Ok(rows)
    }

    fn committed_visibility(&self, commit_ts: u64) -> FilterDecision {
        let visible = match self.reader.isolation {
            IsolationLevel::SnapshotIsolation => commit_ts <= self.reader.begin_timestamp,
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => true,
        };
        if visible {
            FilterDecision::Include
        } else {
            FilterDecision::Skip
        }
    }

    /// Writes of a descendant of the reader, or of a transaction sharing an
    /// ancestor with it, are visible iff every node below the shared node is
    /// committed. `None` if the writer is unrelated to the reader.
    fn family_visibility(&self, chain: &[Txn]) -> Option<FilterDecision> {
        let shared = chain.iter().position(|t| {
            t.id == self.reader.id || self.reader_ancestors.iter().any(|a| a.id == t.id)
        })?;
        let below = &chain[..shared];
        Some(if below.iter().all(|t| t.state == TxnState::Committed) {
            FilterDecision::Include
        } else {
            FilterDecision::Skip
        })
    }

    fn notify(&self, version: &RowVersion, resolution: Resolution) {
        if let (Some(resolver), Some(writer)) = (&self.resolver, version.writer) {
            resolver.resolve(&version.key, writer, resolution);
        }
    }

    fn unresolvable(&self, version: &RowVersion, reason: &str) -> FilterDecision {
        UNRESOLVABLE_WRITERS_TOTAL.inc();
        warn!(key = ?version.key, writer = ?version.writer, %reason, "skipping unresolvable row version");
        FilterDecision::Skip
    }

    async fn writer_chain(&mut self, writer: TxnId) -> Result<Vec<Txn>> {
        let txn = self
            .lookup(writer)
            .await?
            .ok_or_else(|| TxnError::UnresolvableWriter(format!("unknown writer {writer}")))?;
        self.chain_of(txn).await
    }

    /// `txn` followed by its ancestors up to the root, nearest first.
    async fn chain_of(&mut self, txn: Txn) -> Result<Vec<Txn>> {
        let mut seen = HashSet::from([txn.id]);
        let mut next = txn.parent;
        let mut chain = vec![txn];
        while let Some(id) = next {
            if !seen.insert(id) || chain.len() > self.max_depth {
                return Err(TxnError::UnresolvableWriter(format!("malformed ancestry at {id}")));
            }
            let parent = self
                .lookup(id)
                .await?
                .ok_or_else(|| TxnError::UnresolvableWriter(format!("missing ancestor {id}")))?;
            next = parent.parent;
            chain.push(parent);
        }
        Ok(chain)
    }

    async fn lookup(&mut self, id: TxnId) -> Result<Option<Txn>> {
        if let Some(txn) = self.cache.get(&id) {
            return Ok(Some(txn.clone()));
        }
        let txn = self.store.get(id).await?;
        if let Some(t) = txn.as_ref().filter(|t| t.state.is_terminal()) {
            self.cache.insert(id, t.clone());
        }
        Ok(txn)
    }
}
