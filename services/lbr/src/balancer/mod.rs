//! TCP load balancer core.
//!
//! This module provides:
//! - Shared listening sockets, bound once per front-end address
//! - An acceptor pool that accepts under a pool-wide try-lock
//! - Round-robin dispatch to backends, offset per acceptor
//! - Relay workers that copy bytes both ways until either side closes
//! - Failover of connections whose backend connect failed
//! - Reaping of finished workers
//!
//! ## Architecture
//!
//! ```text
//!                  +-> Acceptor 0 -+
//! Client -> SharedListenerSet -+-> Acceptor 1 -+-> RelayWorker -> Backend
//!                  +-> Acceptor N -+      |
//!                                    WorkerRegistry <- FailoverMonitor
//!                                               ^---- ReaperLoop
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let (store, _warnings) = MappingStore::load_file(path)?;
//! let pool = AcceptorPool::new(Arc::new(store), PoolSettings::default());
//! let trigger = pool.shutdown_trigger();
//! pool.setup().await?;
//! // ... trigger.fire() from a signal handler ...
//! pool.wait_for_shutdown_signal().await;
//! pool.shutdown().await;
//! ```

mod acceptor;
mod failover;
mod listener;
mod pool;
mod reaper;
mod registry;
mod relay;

pub use acceptor::{Acceptor, AcceptorState};
pub use failover::{choose_backend, FailoverMonitor};
pub use listener::{bind_listener, Connection, SharedListener, SharedListenerSet};
pub use pool::{AcceptorPool, PoolHealth, PoolSettings, PoolStats, ShutdownTrigger};
pub use reaper::ReaperLoop;
pub use registry::{ActiveWorker, ConnectStatus, WorkerRegistry};
pub use relay::{relay_bidirectional, RelayContext, RelayEnd, RelayOutcome, RelayWorker};

use tokio::sync::watch;

/// Resolve once the shutdown flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Whether the shutdown flag is currently set.
pub(crate) fn is_shutting_down(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
