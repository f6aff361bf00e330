//! Acceptor pool lifecycle.
//!
//! The pool binds the shared listeners, starts the acceptors and the two
//! background loops, and tears everything down again in order: acceptors
//! first, then listeners, then relay workers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::acceptor::Acceptor;
use super::failover::FailoverMonitor;
use super::listener::SharedListenerSet;
use super::reaper::ReaperLoop;
use super::registry::WorkerRegistry;
use super::relay::RelayContext;
use super::{is_shutting_down, wait_for_shutdown};
use crate::error::PoolError;
use crate::mapping::MappingStore;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of acceptor tasks.
    pub num_acceptors: usize,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// How long a worker keeps a client socket after its backend connect failed.
    pub connect_failure_grace: Duration,
    pub failover_interval: Duration,
    pub reap_interval: Duration,
    /// Delay between bind attempts.
    pub bind_retry: Duration,
    /// Upper bound on a single readiness wait.
    pub accept_poll: Duration,
    /// Time allowed for tasks to finish on shutdown before they are aborted.
    pub shutdown_grace: Duration,
    pub backlog: i32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            num_acceptors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            connect_timeout: Duration::from_secs(5),
            connect_failure_grace: Duration::from_secs(6),
            failover_interval: Duration::from_secs(2),
            reap_interval: Duration::from_millis(1500),
            bind_retry: Duration::from_secs(5),
            accept_poll: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(3),
            backlog: 128,
        }
    }
}

/// Externally visible pool state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolHealth {
    Starting,
    /// A listen address could not be bound; another attempt is scheduled.
    BindRetrying {
        listen: String,
        attempt: u32,
        error: String,
    },
    /// Every listener is bound and the acceptors are running.
    Ready { listeners: Vec<SocketAddr> },
    Draining,
    Stopped,
}

/// Pool-wide counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections taken off a listening socket.
    pub connections_accepted: AtomicU64,
    /// Accept calls that failed.
    pub accept_errors: AtomicU64,
    /// Readiness events lost to another acceptor holding the accept lock.
    pub accept_contended: AtomicU64,
    /// Connections handed to a relay worker on first dispatch.
    pub connections_dispatched: AtomicU64,
    /// Connections closed because their listener had no usable mapping.
    pub connections_rejected: AtomicU64,
    pub backend_connected: AtomicU64,
    pub backend_failed: AtomicU64,
    /// Connections moved to another backend by the failover monitor.
    pub failovers: AtomicU64,
    pub relays_completed: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
    pub workers_reaped: AtomicU64,
}

impl PoolStats {
    pub fn log_summary(&self) {
        info!(
            connections_accepted = self.connections_accepted.load(Ordering::Relaxed),
            accept_errors = self.accept_errors.load(Ordering::Relaxed),
            accept_contended = self.accept_contended.load(Ordering::Relaxed),
            connections_dispatched = self.connections_dispatched.load(Ordering::Relaxed),
            connections_rejected = self.connections_rejected.load(Ordering::Relaxed),
            backend_connected = self.backend_connected.load(Ordering::Relaxed),
            backend_failed = self.backend_failed.load(Ordering::Relaxed),
            failovers = self.failovers.load(Ordering::Relaxed),
            relays_completed = self.relays_completed.load(Ordering::Relaxed),
            bytes_to_backend = self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend = self.bytes_from_backend.load(Ordering::Relaxed),
            workers_reaped = self.workers_reaped.load(Ordering::Relaxed),
            "Pool statistics"
        );
    }
}

/// Requests pool shutdown. Safe to call from a signal handler task.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}

/// Tasks and sockets that exist while the pool runs.
struct Running {
    listeners: SharedListenerSet,
    acceptors: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

/// N acceptors over one set of shared listeners.
pub struct AcceptorPool {
    store: Arc<MappingStore>,
    settings: PoolSettings,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    health: watch::Sender<PoolHealth>,
    stats: Arc<PoolStats>,
    registry: Arc<WorkerRegistry>,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl AcceptorPool {
    pub fn new(store: Arc<MappingStore>, settings: PoolSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health, _) = watch::channel(PoolHealth::Starting);
        Self {
            store,
            settings,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            health,
            stats: Arc::new(PoolStats::default()),
            registry: Arc::new(WorkerRegistry::new()),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(Arc::clone(&self.shutdown_tx))
    }

    /// Subscribe to health transitions.
    pub fn health(&self) -> watch::Receiver<PoolHealth> {
        self.health.subscribe()
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Bound listener addresses, keyed by mapping key. Empty unless running.
    pub async fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.listeners.local_addrs())
            .unwrap_or_default()
    }

    /// Bind listeners and start the acceptors and background loops.
    ///
    /// Binding is retried until it succeeds or shutdown is requested, so this
    /// only returns early with [`PoolError::Cancelled`].
    pub async fn setup(&self) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        let mappings = self.store.mappings();
        if mappings.is_empty() {
            return Err(PoolError::NoListeners);
        }

        // Held for the whole startup so shutdown observes either nothing or
        // a fully started pool.
        let mut running = self.running.lock().await;
        self.health.send_replace(PoolHealth::Starting);

        info!(
            mapping_count = mappings.len(),
            acceptors = self.settings.num_acceptors,
            "Starting acceptor pool"
        );

        let mut shutdown = self.shutdown_rx.clone();
        let mut listeners = SharedListenerSet::bind(
            &mappings,
            self.settings.backlog,
            self.settings.bind_retry,
            &self.health,
            &mut shutdown,
        )
        .await?;

        if is_shutting_down(&self.shutdown_rx) {
            listeners.close();
            return Err(PoolError::Cancelled);
        }

        let relay = RelayContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            self.settings.connect_timeout,
            self.settings.connect_failure_grace,
            self.shutdown_rx.clone(),
        );

        let accept_lock = Arc::new(Mutex::new(()));
        let acceptors = (0..self.settings.num_acceptors.max(1))
            .map(|id| {
                let acceptor = Acceptor::new(
                    id,
                    listeners.handles(),
                    Arc::clone(&accept_lock),
                    relay.clone(),
                    self.settings.accept_poll,
                );
                tokio::spawn(
                    acceptor
                        .run(self.shutdown_rx.clone())
                        .instrument(info_span!("acceptor", acceptor_id = id)),
                )
            })
            .collect();

        let monitor = FailoverMonitor::new(relay, self.settings.failover_interval);
        let reaper = ReaperLoop::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            self.settings.reap_interval,
        );
        let background = vec![
            tokio::spawn(monitor.run(self.shutdown_rx.clone())),
            tokio::spawn(reaper.run(self.shutdown_rx.clone())),
        ];

        let addrs: Vec<SocketAddr> = listeners
            .local_addrs()
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();
        info!(listener_count = addrs.len(), "Acceptor pool ready");
        self.health
            .send_replace(PoolHealth::Ready { listeners: addrs });

        *running = Some(Running {
            listeners,
            acceptors,
            background,
        });
        Ok(())
    }

    /// Resolve once shutdown has been requested through any trigger.
    pub async fn wait_for_shutdown_signal(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        wait_for_shutdown(&mut shutdown).await;
    }

    /// Stop everything. Only the first call does any work.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down acceptor pool");
        self.shutdown_tx.send_replace(true);

        let running = self.running.lock().await.take();
        self.health.send_replace(PoolHealth::Draining);
        let grace = self.settings.shutdown_grace;

        if let Some(mut running) = running {
            join_within(running.acceptors, Instant::now() + grace, "acceptor").await;
            running.listeners.close();
            join_within(running.background, Instant::now() + grace, "background").await;
        }

        self.drain_workers(grace).await;

        self.health.send_replace(PoolHealth::Stopped);
        self.stats.log_summary();
        info!("Acceptor pool stopped");
    }

    /// Join relay workers, escalating from a short wait to a full grace
    /// period, then abort what is left.
    async fn drain_workers(&self, grace: Duration) {
        let handles = self.registry.drain().await;
        if handles.is_empty() {
            return;
        }
        debug!(worker_count = handles.len(), "Draining relay workers");

        let quick = Instant::now() + grace / 10;
        let mut pending = Vec::new();
        for (id, mut handle) in handles {
            if timeout_at(quick, &mut handle).await.is_err() {
                pending.push((id, handle));
            }
        }
        if pending.is_empty() {
            return;
        }

        warn!(remaining = pending.len(), "Relay workers still running");
        let deadline = Instant::now() + grace;
        for (id, mut handle) in pending {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!(worker_id = id, "Aborting relay worker");
                handle.abort();
            }
        }
    }
}

impl Drop for AcceptorPool {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn join_within(handles: Vec<JoinHandle<()>>, deadline: Instant, task: &'static str) {
    for mut handle in handles {
        match timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!(task, error = %e, "Task panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(task, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}
