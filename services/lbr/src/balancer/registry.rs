//! Active-worker registry.
//!
//! Every relay worker is recorded here from spawn until it is reaped. The
//! record carries the connect-failure flag read by the failover monitor and,
//! after a failed connect, the parked client connection awaiting reassignment.
//!
//! Locks are held only around map inserts and removals; no IO happens under them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use super::listener::Connection;
use crate::mapping::BackendTarget;

/// Backend connect status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    /// No failure reported.
    Unset = 0,
    /// The backend connect failed and the client connection is parked.
    Failed = 1,
    /// The failover monitor took the client connection to a new worker.
    Reassigned = 2,
}

impl ConnectStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectStatus::Failed,
            2 => ConnectStatus::Reassigned,
            _ => ConnectStatus::Unset,
        }
    }
}

/// Record for one relay worker.
pub struct ActiveWorker {
    id: u64,
    client_addr: SocketAddr,
    mapping_key: String,
    backend: BackendTarget,
    attempt: u32,
    status: AtomicU8,
    finished: AtomicBool,
    parked: Mutex<Option<Connection>>,
    released: Notify,
}

impl ActiveWorker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Key of the mapping the connection arrived on.
    pub fn mapping_key(&self) -> &str {
        &self.mapping_key
    }

    pub fn backend(&self) -> &BackendTarget {
        &self.backend
    }

    /// 1 for the first dispatch of a connection, +1 per reassignment.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> ConnectStatus {
        ConnectStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Park the client connection and raise the failure flag.
    ///
    /// The connection is stored before the flag becomes visible, so a reader
    /// that observes [`ConnectStatus::Failed`] always finds it.
    pub(crate) async fn park_failed(&self, conn: Connection) {
        *self.parked.lock().await = Some(conn);
        self.status
            .store(ConnectStatus::Failed as u8, Ordering::Release);
    }

    /// Claim a failed worker for reassignment. Only one caller wins.
    pub(crate) fn claim_failed(&self) -> bool {
        self.status
            .compare_exchange(
                ConnectStatus::Failed as u8,
                ConnectStatus::Reassigned as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Take the parked client connection, if any.
    pub(crate) async fn take_parked(&self) -> Option<Connection> {
        self.parked.lock().await.take()
    }

    /// Wake the worker holding this record so it can retire.
    pub(crate) fn release(&self) {
        self.released.notify_one();
    }

    /// Resolves after [`release`](Self::release) has been called.
    pub(crate) async fn released(&self) {
        self.released.notified().await;
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ActiveWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveWorker")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("backend", &self.backend)
            .field("attempt", &self.attempt)
            .field("status", &self.status())
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct WorkerEntry {
    record: Arc<ActiveWorker>,
    handle: Option<JoinHandle<()>>,
}

/// The set of live relay workers.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<u64, WorkerEntry>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a record for a worker about to be spawned.
    pub async fn register(
        &self,
        client_addr: SocketAddr,
        mapping_key: &str,
        backend: BackendTarget,
        attempt: u32,
    ) -> Arc<ActiveWorker> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = Arc::new(ActiveWorker {
            id,
            client_addr,
            mapping_key: mapping_key.to_string(),
            backend,
            attempt,
            status: AtomicU8::new(ConnectStatus::Unset as u8),
            finished: AtomicBool::new(false),
            parked: Mutex::new(None),
            released: Notify::new(),
        });

        self.workers.lock().await.insert(
            id,
            WorkerEntry {
                record: Arc::clone(&record),
                handle: None,
            },
        );
        record
    }

    /// Attach the task handle to a registered worker.
    ///
    /// If the worker was already reaped the handle is dropped, detaching the task.
    pub async fn attach(&self, id: u64, handle: JoinHandle<()>) {
        if let Some(entry) = self.workers.lock().await.get_mut(&id) {
            entry.handle = Some(handle);
        }
    }

    /// Snapshot of every record.
    pub async fn snapshot(&self) -> Vec<Arc<ActiveWorker>> {
        self.workers
            .lock()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.record))
            .collect()
    }

    /// Records whose backend connect failed and that await reassignment.
    pub async fn failed(&self) -> Vec<Arc<ActiveWorker>> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|entry| entry.record.status() == ConnectStatus::Failed)
            .map(|entry| Arc::clone(&entry.record))
            .collect()
    }

    /// Remove finished workers. Returns how many were removed.
    ///
    /// A finished worker still flagged [`ConnectStatus::Failed`] holds a parked
    /// client connection and is kept until the failover monitor takes it.
    pub async fn reap(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let before = workers.len();
        workers.retain(|id, entry| {
            let done = entry.record.is_finished()
                || entry.handle.as_ref().is_some_and(JoinHandle::is_finished);
            let keep = !done || entry.record.status() == ConnectStatus::Failed;
            if !keep {
                debug!(worker_id = id, "Reaped worker");
            }
            keep
        });
        before - workers.len()
    }

    /// Remove every worker, returning the task handles still attached.
    ///
    /// Parked connections close once their record is dropped.
    pub async fn drain(&self) -> Vec<(u64, JoinHandle<()>)> {
        self.workers
            .lock()
            .await
            .drain()
            .filter_map(|(id, entry)| entry.handle.map(|handle| (id, handle)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        (Connection { stream, peer_addr }, client)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let registry = WorkerRegistry::new();
        let a = registry
            .register(addr(), "0.0.0.0:1", BackendTarget::new("a", 1), 1)
            .await;
        let b = registry
            .register(addr(), "0.0.0.0:1", BackendTarget::new("b", 1), 1)
            .await;

        assert_ne!(a.id(), b.id());
        assert_eq!(a.status(), ConnectStatus::Unset);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_failure_flag_lifecycle() {
        let registry = WorkerRegistry::new();
        let record = registry
            .register(addr(), "0.0.0.0:1", BackendTarget::new("a", 1), 1)
            .await;
        let (conn, _client) = connection().await;

        record.park_failed(conn).await;
        assert_eq!(record.status(), ConnectStatus::Failed);
        assert_eq!(registry.failed().await.len(), 1);

        assert!(record.claim_failed());
        assert!(!record.claim_failed());
        assert_eq!(record.status(), ConnectStatus::Reassigned);
        assert!(record.take_parked().await.is_some());
        assert!(record.take_parked().await.is_none());
        assert!(registry.failed().await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_keeps_running_and_parked_workers() {
        let registry = WorkerRegistry::new();
        let running = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;
        let done = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;
        let parked = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;

        done.mark_finished();
        let (conn, _client) = connection().await;
        parked.park_failed(conn).await;
        parked.mark_finished();

        assert_eq!(registry.reap().await, 1);
        let ids: Vec<u64> = registry.snapshot().await.iter().map(|r| r.id()).collect();
        assert!(ids.contains(&running.id()));
        assert!(ids.contains(&parked.id()));

        // Once reassigned, the parked record is reapable.
        assert!(parked.claim_failed());
        assert_eq!(registry.reap().await, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_reap_uses_task_handle() {
        let registry = WorkerRegistry::new();
        let record = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;
        let handle = tokio::spawn(async {});
        tokio::task::yield_now().await;
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        registry.attach(record.id(), handle).await;

        assert_eq!(registry.reap().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let registry = WorkerRegistry::new();
        let record = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;

        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.released().await })
        };
        record.release();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = WorkerRegistry::new();
        let record = registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;
        registry.attach(record.id(), tokio::spawn(async {})).await;
        registry
            .register(addr(), "k", BackendTarget::new("a", 1), 1)
            .await;

        let handles = registry.drain().await;
        assert_eq!(handles.len(), 1);
        assert!(registry.is_empty().await);
    }
}
