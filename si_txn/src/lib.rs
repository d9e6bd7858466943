//! sidb transaction core: multi-version transactions with nested savepoints
//! over a sorted key-value store.
//!
//! [`TxnLifecycleManager`] creates and terminates transactions against a
//! [`TxnStore`], [`ConnectionTxn`] maps a connection's savepoints onto child
//! transactions, and [`TxnFilter`] decides which row versions a reader sees.
#![deny(missing_docs)]

/// Tunables loaded from YAML.
pub mod config;
/// Error type shared by the core.
pub mod error;
pub mod filter;
/// Timestamp sources.
pub mod gtm;
pub mod lifecycle;
pub mod resolver;
pub mod savepoint;
/// Durable transaction records.
pub mod store;
/// Transaction model.
pub mod txn;

pub use config::TxnConfig;
pub use error::{Result, TxnError};
pub use filter::{effective_state, EffectiveState, FilterDecision, TxnFilter};
pub use gtm::{Gtm, TimestampSource};
pub use lifecycle::TxnLifecycleManager;
pub use resolver::{NoopReadResolver, QueuedReadResolver, ReadResolver};
pub use savepoint::{ConnectionState, ConnectionTxn, BATCH_SAVEPOINT};
pub use store::{MemTxnStore, TxnStore};
pub use txn::{Destination, IsolationLevel, Outcome, TableId, Txn, TxnId, TxnState};
