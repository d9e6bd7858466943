//! Read resolution: caching a writer's terminal outcome onto the row versions it wrote.

use std::sync::{Arc, Mutex};

use si_metrics::{RESOLUTIONS_APPLIED_TOTAL, RESOLUTIONS_DROPPED_TOTAL, RESOLUTIONS_ENQUEUED_TOTAL};
use si_storage::{KvStore, Resolution, WriterId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fire-and-forget sink for resolved outcomes. Implementations must not block.
pub trait ReadResolver: Send + Sync {
    /// Record that the version of `key` written by `writer` resolved to `resolution`.
    fn resolve(&self, key: &[u8], writer: WriterId, resolution: Resolution);
}

/// Resolver that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReadResolver;

impl ReadResolver for NoopReadResolver {
    fn resolve(&self, _key: &[u8], _writer: WriterId, _resolution: Resolution) {}
}

enum Message {
    Resolve {
        key: Vec<u8>,
        writer: WriterId,
        resolution: Resolution,
    },
    Shutdown,
}

/// Resolver backed by a bounded queue and one background writer task.
///
/// A full queue drops the newest request. Failed writes are logged and
/// forgotten: the next reader of the version walks the ancestry again.
pub struct QueuedReadResolver {
    tx: mpsc::Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedReadResolver {
    /// Start the background writer on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KvStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(store, rx));
        Self { tx, worker: Mutex::new(Some(worker)) }
    }

    /// Drain what is already queued, then stop the background writer.
    /// Later calls to `resolve` are dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl ReadResolver for QueuedReadResolver {
    fn resolve(&self, key: &[u8], writer: WriterId, resolution: Resolution) {
        let msg = Message::Resolve { key: key.to_vec(), writer, resolution };
        match self.tx.try_send(msg) {
            Ok(()) => RESOLUTIONS_ENQUEUED_TOTAL.inc(),
            Err(e) => {
                RESOLUTIONS_DROPPED_TOTAL.inc();
                debug!(writer, reason = %e, "dropped read resolution");
            }
        }
    }
}

async fn run_worker(store: Arc<dyn KvStore>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Resolve { key, writer, resolution } => {
                match store.background_write(&key, writer, resolution).await {
                    Ok(()) => RESOLUTIONS_APPLIED_TOTAL.inc(),
                    Err(e) => debug!(writer, error = %e, "read resolution not persisted"),
                }
            }
            Message::Shutdown => break,
        }
    }
}
