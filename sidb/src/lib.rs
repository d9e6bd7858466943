#![deny(missing_docs)]
#![doc = "sidb: snapshot-isolated transactions with nested savepoints over a sorted key-value store."]

use std::sync::Arc;

use si_storage::{KvStore, MemKvStore};
use si_txn::{
    ConnectionState, ConnectionTxn, Gtm, MemTxnStore, QueuedReadResolver, ReadResolver, TableId, TimestampSource,
    Txn, TxnConfig, TxnError, TxnFilter, TxnLifecycleManager, TxnStore,
};
use thiserror::Error;
use tracing::{debug, info};

pub mod script;

/// Errors surfaced by a [`Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transaction core failure.
    #[error(transparent)]
    Txn(#[from] TxnError),
    /// Another writer holds the row lock.
    #[error("row {} is locked by another writer", String::from_utf8_lossy(.0))]
    RowLocked(Vec<u8>),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Transaction services wired together: timestamp source, transaction store,
/// key-value store and the optional read resolver.
pub struct Database {
    lifecycle: Arc<TxnLifecycleManager>,
    kv: Arc<dyn KvStore>,
    resolver: Option<Arc<QueuedReadResolver>>,
}

impl Database {
    /// In-memory database. Spawns the read resolver on the current tokio runtime
    /// when `config.read_resolution` is set.
    pub fn open(config: TxnConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_services(
            Arc::new(Gtm::default()),
            Arc::new(MemTxnStore::new()),
            Arc::new(MemKvStore::new()),
            config,
        ))
    }

    /// Database over injected services.
    pub fn with_services(
        timestamps: Arc<dyn TimestampSource>,
        store: Arc<dyn TxnStore>,
        kv: Arc<dyn KvStore>,
        config: TxnConfig,
    ) -> Self {
        let resolver = config
            .read_resolution
            .then(|| Arc::new(QueuedReadResolver::spawn(kv.clone(), config.resolver_queue_capacity)));
        info!(read_resolution = config.read_resolution, isolation = ?config.default_isolation, "database opened");
        Self {
            lifecycle: Arc::new(TxnLifecycleManager::new(timestamps, store, config)),
            kv,
            resolver,
        }
    }

    /// Open a connection named `name`. Its transaction begins lazily.
    pub fn session(&self, name: impl Into<String>) -> Session {
        Session {
            conn: ConnectionTxn::new(self.lifecycle.clone(), name),
            kv: self.kv.clone(),
            store: self.lifecycle.store(),
            resolver: self.resolver.clone().map(|r| r as Arc<dyn ReadResolver>),
            max_depth: self.lifecycle.config().max_ancestor_depth,
        }
    }

    /// Lifecycle manager shared by every session.
    pub fn lifecycle(&self) -> &Arc<TxnLifecycleManager> {
        &self.lifecycle
    }

    /// Underlying key-value store.
    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    /// Begin and roll back a throwaway transaction to prove the services answer.
    pub async fn health_check(&self) -> bool {
        let probe = async {
            let txn = self.lifecycle.begin_transaction().await?;
            self.lifecycle.rollback(&txn).await
        };
        match probe.await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Drain and stop the read resolver.
    pub async fn shutdown(&self) {
        if let Some(resolver) = &self.resolver {
            resolver.shutdown().await;
        }
    }
}

/// One client connection: a [`ConnectionTxn`] plus data access under its leaf
/// transaction.
pub struct Session {
    conn: ConnectionTxn,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn TxnStore>,
    resolver: Option<Arc<dyn ReadResolver>>,
    max_depth: usize,
}

impl Session {
    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Savepoint stack depth.
    pub fn depth(&self) -> usize {
        self.conn.depth()
    }

    /// Leaf transaction, if active.
    pub fn current_txn(&self) -> Option<&Txn> {
        self.conn.current_txn()
    }

    /// Start the connection transaction now rather than on the first statement.
    pub async fn begin(&mut self) -> Result<Txn> {
        Ok(self.conn.active_txn().await?)
    }

    /// Write `value` to `key` in `table` under the current leaf transaction.
    pub async fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(table, key, Some(value.to_vec())).await
    }

    /// Write a tombstone for `key` in `table`.
    pub async fn delete(&mut self, table: &str, key: &[u8]) -> Result<()> {
        self.write(table, key, None).await
    }

    /// Newest value of `key` visible to the current leaf transaction.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut filter = self.filter().await?;
        Ok(filter.read(self.kv.as_ref(), key).await?)
    }

    /// Visible rows in `[start, end)`, keys ascending.
    pub async fn scan(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut filter = self.filter().await?;
        Ok(filter.scan(self.kv.as_ref(), start, end).await?)
    }

    /// See [`ConnectionTxn::set_savepoint`].
    pub async fn set_savepoint(&mut self, name: &str) -> Result<usize> {
        Ok(self.conn.set_savepoint(name).await?)
    }

    /// See [`ConnectionTxn::release_savepoint`].
    pub async fn release_savepoint(&mut self, name: &str) -> Result<usize> {
        Ok(self.conn.release_savepoint(name).await?)
    }

    /// See [`ConnectionTxn::rollback_to_savepoint`].
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<usize> {
        Ok(self.conn.rollback_to_savepoint(name).await?)
    }

    /// Commit the connection transaction. `None` when there was nothing to commit.
    pub async fn commit(&mut self) -> Result<Option<u64>> {
        Ok(self.conn.commit().await?)
    }

    /// Roll back the connection transaction.
    pub async fn abort(&mut self) -> Result<()> {
        Ok(self.conn.abort().await?)
    }

    /// Abort and close the connection for good.
    pub async fn close(&mut self) -> Result<()> {
        Ok(self.conn.close().await?)
    }

    async fn write(&mut self, table: &str, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        let leaf = self.conn.elevate(&TableId::new(table)).await?;
        let writer = leaf.id.0;
        if !self.kv.try_lock(key, writer).await.map_err(TxnError::from)? {
            return Err(SessionError::RowLocked(key.to_vec()));
        }
        let written = self.kv.put(key, value, writer).await;
        let unlocked = self.kv.unlock(key, writer).await;
        written.map_err(TxnError::from)?;
        unlocked.map_err(TxnError::from)?;
        Ok(())
    }

    async fn filter(&mut self) -> Result<TxnFilter> {
        let reader = self.conn.active_txn().await?;
        Ok(TxnFilter::new(self.store.clone(), reader, self.resolver.clone(), self.max_depth).await?)
    }
}
