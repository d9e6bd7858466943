use si_storage::StorageError;
use thiserror::Error;

use crate::txn::{TxnId, TxnState};

/// Result type alias for transaction core operations.
pub type Result<T> = std::result::Result<T, TxnError>;

/// Transaction core errors.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Transaction store, timestamp source or storage adapter cannot be reached.
    /// Transient; the caller decides whether to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Commit or rollback of a transaction that already reached a terminal state.
    #[error("transaction {id} is already {state:?}")]
    AlreadyTerminal {
        /// Transaction that was targeted.
        id: TxnId,
        /// State it is in.
        state: TxnState,
    },
    /// Release or rollback referenced a savepoint name that is not on the stack.
    #[error("savepoint {0} does not exist")]
    SavepointNotFound(String),
    /// Operation attempted after the connection transaction was closed.
    #[error("transaction has already closed")]
    TransactionClosed,
    /// A row version or ancestry chain that cannot be resolved to a transaction.
    #[error("unresolvable writer: {0}")]
    UnresolvableWriter(String),
    /// The parent chain of a transaction being created, elevated or used as a
    /// reader is cyclic, broken or deeper than `max_ancestor_depth`.
    #[error("malformed ancestry: {0}")]
    MalformedAncestry(String),
    /// Creating a child of `parent` would nest deeper than `max` levels.
    #[error("transaction {parent} is already nested {max} levels deep")]
    NestingTooDeep {
        /// Would-be parent.
        parent: TxnId,
        /// Configured `max_ancestor_depth`.
        max: usize,
    },
    /// No record for the transaction id.
    #[error("transaction {0} not found")]
    NotFound(TxnId),
    /// A record with this id is already stored.
    #[error("transaction {0} already exists")]
    AlreadyExists(TxnId),
    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<StorageError> for TxnError {
    fn from(e: StorageError) -> Self {
        TxnError::StorageUnavailable(e.to_string())
    }
}
