//! Acceptors.
//!
//! Every acceptor waits on readiness of every shared listener. When a listener
//! becomes ready, all acceptors wake; the one that wins a pool-wide try-lock
//! performs a single non-blocking accept and the others skip the cycle. The
//! lock is never awaited and never held across an await point.
//!
//! Accepted connections are dispatched round-robin. Each acceptor keeps its own
//! counter and offsets it by its id, so acceptors start from different backends.

use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::listener::{Connection, SharedListener};
use super::pool::PoolStats;
use super::relay::{RelayContext, RelayWorker};
use super::wait_for_shutdown;
use crate::mapping::MappingStore;

/// Pause after an accept error so a persistent failure cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of an acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// One of N symmetric accept loops sharing the same listeners.
pub struct Acceptor {
    id: usize,
    listeners: Vec<SharedListener>,
    accept_lock: Arc<Mutex<()>>,
    store: Arc<MappingStore>,
    relay: RelayContext,
    stats: Arc<PoolStats>,
    poll_timeout: Duration,
    dispatched: usize,
    state: watch::Sender<AcceptorState>,
}

impl Acceptor {
    pub fn new(
        id: usize,
        listeners: Vec<SharedListener>,
        accept_lock: Arc<Mutex<()>>,
        relay: RelayContext,
        poll_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AcceptorState::Starting);
        Self {
            id,
            listeners,
            accept_lock,
            store: Arc::clone(relay.store()),
            stats: Arc::clone(relay.stats()),
            relay,
            poll_timeout,
            dispatched: 0,
            state,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<AcceptorState> {
        self.state.subscribe()
    }

    /// Backend index for the next dispatch against `backend_count` backends.
    pub fn next_index(&mut self, backend_count: usize) -> usize {
        let index = self.dispatched.wrapping_add(self.id) % backend_count;
        self.dispatched = self.dispatched.wrapping_add(1);
        index
    }

    /// Accept and dispatch until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.listeners.is_empty() {
            warn!(acceptor_id = self.id, "Acceptor has no listeners");
            self.state.send_replace(AcceptorState::Stopped);
            return;
        }

        self.state.send_replace(AcceptorState::Running);
        debug!(
            acceptor_id = self.id,
            listener_count = self.listeners.len(),
            "Acceptor running"
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = self.run_once() => {}
            }
        }

        self.state.send_replace(AcceptorState::Draining);
        // Drop our listener handles; the listener set closes the sockets.
        self.listeners.clear();
        self.state.send_replace(AcceptorState::Stopped);
        debug!(
            acceptor_id = self.id,
            dispatched = self.dispatched,
            "Acceptor shutdown"
        );
    }

    /// One readiness wait, at most one accept, then dispatch.
    async fn run_once(&mut self) {
        let accepted = match self.accept_ready().await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                error!(acceptor_id = self.id, error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                return;
            }
        };

        if let Some((listener_idx, stream, peer_addr)) = accepted {
            self.dispatch(listener_idx, stream, peer_addr).await;
        }
    }

    async fn accept_ready(&self) -> io::Result<Option<(usize, StdTcpStream, SocketAddr)>> {
        let waits = self
            .listeners
            .iter()
            .map(|listener| Box::pin(listener.readable()));

        let (idx, ready) = match tokio::time::timeout(self.poll_timeout, select_all(waits)).await {
            Ok((ready, idx, _rest)) => (idx, ready),
            Err(_) => return Ok(None),
        };
        let mut guard = ready?;

        let Ok(_held) = self.accept_lock.try_lock() else {
            // Another acceptor is servicing this readiness event.
            self.stats.accept_contended.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            tokio::task::yield_now().await;
            return Ok(None);
        };

        match guard.try_io(|fd| fd.get_ref().accept()) {
            Ok(Ok((stream, peer_addr))) => Ok(Some((idx, stream, peer_addr))),
            Ok(Err(e)) => Err(e),
            // Readiness was stale and has been cleared.
            Err(_would_block) => Ok(None),
        }
    }

    async fn dispatch(&mut self, listener_idx: usize, stream: StdTcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        let Some(listener) = self.listeners.get(listener_idx) else {
            return;
        };
        let key = listener.key().to_string();

        let stream = match stream
            .set_nonblocking(true)
            .and_then(|()| TcpStream::from_std(stream))
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Failed to register accepted connection");
                return;
            }
        };

        let Some(mapping) = self.store.get(&key) else {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            warn!(listen = %key, peer = %peer_addr, "No mapping for listener, closing connection");
            return;
        };
        if mapping.is_empty() {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            warn!(listen = %key, peer = %peer_addr, "Mapping has no backends, closing connection");
            return;
        }

        let index = self.next_index(mapping.len());
        let backend = mapping.backends()[index].clone();

        debug!(
            acceptor_id = self.id,
            listen = %key,
            peer = %peer_addr,
            backend = %backend,
            index,
            "Dispatched connection"
        );
        self.stats
            .connections_dispatched
            .fetch_add(1, Ordering::Relaxed);

        RelayWorker::spawn(
            &self.relay,
            Connection { stream, peer_addr },
            &key,
            backend,
            1,
        )
        .await;
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if *self.state.borrow() != AcceptorState::Stopped {
            info!(acceptor_id = self.id, "Acceptor dropped before stopping");
            self.state.send_replace(AcceptorState::Stopped);
        }
    }
}
