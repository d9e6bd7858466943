use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Table a transaction may write to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub String);

impl TableId {
    /// Build a table id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolation level a transaction reads under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Sees writes committed at or before its begin timestamp.
    #[default]
    SnapshotIsolation,
    /// Sees every committed write.
    ReadCommitted,
    /// Sees every write that is not rolled back.
    ReadUncommitted,
}

/// Recorded transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Active running.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl TxnState {
    /// Committed and RolledBack never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

/// Terminal transition applied to a stored transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit at `commit_ts`.
    Committed {
        /// Local commit timestamp.
        commit_ts: u64,
        /// Commit timestamp of the outermost committed ancestor, when already known.
        global_commit_ts: Option<u64>,
    },
    /// Roll back.
    RolledBack,
}

/// Set of tables a writable transaction may write to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination(BTreeSet<TableId>);

impl Destination {
    /// Destination covering a single table.
    pub fn of(table: TableId) -> Self {
        Self(BTreeSet::from([table]))
    }

    /// True if writes to `table` are permitted.
    pub fn covers(&self, table: &TableId) -> bool {
        self.0.contains(table)
    }

    /// Add `table`. Returns `false` if it was already covered.
    pub fn insert(&mut self, table: TableId) -> bool {
        self.0.insert(table)
    }

    /// Tables in this destination.
    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.0.iter()
    }
}

/// One node of the transaction tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    /// Unique id, assigned at creation.
    pub id: TxnId,
    /// Snapshot boundary.
    pub begin_timestamp: u64,
    /// Parent transaction, `None` for a root.
    pub parent: Option<TxnId>,
    /// Set iff `state == Committed`.
    pub commit_timestamp: Option<u64>,
    /// Commit timestamp of the outermost committed ancestor, when known at commit.
    pub global_commit_timestamp: Option<u64>,
    /// Isolation level used when this transaction reads.
    pub isolation: IsolationLevel,
    /// Recorded state.
    pub state: TxnState,
    /// Rolled back whenever the parent is rolled back.
    pub dependent: bool,
    /// Conflict-detection flag for writes; stored only.
    pub additive: bool,
    /// Tables this transaction may write to. `None` means read-only.
    pub destination: Option<Destination>,
    /// Number of ancestors; 0 for a root.
    #[serde(default)]
    pub depth: usize,
}

impl Txn {
    /// A fresh active root transaction.
    pub fn root(id: TxnId, begin_timestamp: u64, isolation: IsolationLevel) -> Self {
        Self {
            id,
            begin_timestamp,
            parent: None,
            commit_timestamp: None,
            global_commit_timestamp: None,
            isolation,
            state: TxnState::Active,
            dependent: false,
            additive: false,
            destination: None,
            depth: 0,
        }
    }

    /// A fresh active, dependent child of `parent`.
    pub fn child(
        id: TxnId,
        begin_timestamp: u64,
        parent: &Txn,
        isolation: IsolationLevel,
        additive: bool,
        destination: Option<Destination>,
    ) -> Self {
        Self {
            id,
            begin_timestamp,
            parent: Some(parent.id),
            commit_timestamp: None,
            global_commit_timestamp: None,
            isolation,
            state: TxnState::Active,
            dependent: true,
            additive,
            destination,
            depth: parent.depth + 1,
        }
    }

    /// True for a transaction without a parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True once elevated to writable for any table.
    pub fn allows_writes(&self) -> bool {
        self.destination.is_some()
    }

    /// True if writes to `table` are permitted.
    pub fn writable_for(&self, table: &TableId) -> bool {
        self.destination.as_ref().is_some_and(|d| d.covers(table))
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn(id={}, begin={}, state={:?}", self.id, self.begin_timestamp, self.state)?;
        if let Some(parent) = self.parent {
            write!(f, ", parent={parent}")?;
        }
        if self.allows_writes() {
            f.write_str(", writable")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_link_and_is_dependent() {
        let root = Txn::root(TxnId(1), 1, IsolationLevel::SnapshotIsolation);
        let child = Txn::child(TxnId(2), 2, &root, IsolationLevel::ReadCommitted, true, None);
        assert!(root.is_root());
        assert_eq!(child.parent, Some(TxnId(1)));
        assert!(child.dependent && child.additive);
        assert_eq!((root.depth, child.depth), (0, 1));
        assert!(!child.allows_writes());
    }

    #[test]
    fn destination_covers_only_inserted_tables() {
        let t1 = TableId::new("t1");
        let mut dest = Destination::of(t1.clone());
        assert!(dest.covers(&t1));
        assert!(!dest.covers(&TableId::new("t2")));
        assert!(!dest.insert(t1));
        assert!(dest.insert(TableId::new("t2")));
        assert_eq!(dest.tables().count(), 2);
    }

    #[test]
    fn isolation_level_reads_snake_case() {
        let lvl: IsolationLevel = serde_yaml::from_str("read_committed").unwrap();
        assert_eq!(lvl, IsolationLevel::ReadCommitted);
        assert!(TxnState::RolledBack.is_terminal());
        assert!(!TxnState::Active.is_terminal());
    }
}
