//! Shared listening sockets.
//!
//! Each front-end address is bound exactly once. The bound socket is
//! registered with the reactor once and every acceptor holds a clone of the
//! same registration, so all of them are woken by the same readiness event and
//! nobody re-binds the address.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::pool::PoolHealth;
use super::wait_for_shutdown;
use crate::error::PoolError;
use crate::mapping::Mapping;

/// An accepted client connection. Owned by exactly one relay worker at a time.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// A non-owning handle to one shared listening socket.
///
/// Cloning shares the same reactor registration. The socket closes when the
/// owning [`SharedListenerSet`] and every clone have been dropped.
#[derive(Clone)]
pub struct SharedListener {
    key: Arc<str>,
    local_addr: SocketAddr,
    fd: Arc<AsyncFd<StdTcpListener>>,
}

impl SharedListener {
    /// Mapping key this listener serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait until the socket reports a pending connection.
    pub(crate) async fn readable(&self) -> io::Result<AsyncFdReadyGuard<'_, StdTcpListener>> {
        self.fd.readable().await
    }
}

impl std::fmt::Debug for SharedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedListener")
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Create a non-blocking listening socket.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn resolve_listen_addr(mapping: &Mapping) -> io::Result<SocketAddr> {
    (mapping.listen_address(), mapping.listen_port())
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {}", mapping.key()),
            )
        })
}

/// One listening socket per distinct front-end address.
///
/// Sole owner of the sockets. Dropping the set (or calling [`close`]) releases
/// them once acceptors have dropped their handles.
///
/// [`close`]: SharedListenerSet::close
#[derive(Debug, Default)]
pub struct SharedListenerSet {
    listeners: Vec<SharedListener>,
}

impl SharedListenerSet {
    /// Bind every mapping's listen address.
    ///
    /// A failed bind is retried every `retry` until it succeeds. Each failure is
    /// published as [`PoolHealth::BindRetrying`]. Returns
    /// [`PoolError::Cancelled`] if shutdown is requested while retrying; any
    /// sockets bound so far are closed on that path.
    pub async fn bind(
        mappings: &[Arc<Mapping>],
        backlog: i32,
        retry: Duration,
        health: &watch::Sender<PoolHealth>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Self, PoolError> {
        let mut set = Self::default();

        for mapping in mappings {
            let key = mapping.key();
            let mut attempt = 0u32;

            let listener = loop {
                attempt += 1;
                let result = resolve_listen_addr(mapping)
                    .and_then(|addr| bind_listener(addr, backlog))
                    .and_then(|listener| {
                        let local_addr = listener.local_addr()?;
                        Ok((local_addr, AsyncFd::try_new(listener)?))
                    });

                match result {
                    Ok((local_addr, fd)) => {
                        info!(listen = %key, bind_addr = %local_addr, "Listener bound");
                        break SharedListener {
                            key: Arc::from(key.as_str()),
                            local_addr,
                            fd: Arc::new(fd),
                        };
                    }
                    Err(e) => {
                        error!(
                            listen = %key,
                            attempt,
                            retry_ms = retry.as_millis() as u64,
                            error = %e,
                            "Failed to bind, retrying"
                        );
                        health.send_replace(PoolHealth::BindRetrying {
                            listen: key.clone(),
                            attempt,
                            error: e.to_string(),
                        });

                        tokio::select! {
                            _ = tokio::time::sleep(retry) => {}
                            _ = wait_for_shutdown(shutdown) => {
                                warn!(listen = %key, "Shutdown requested while binding");
                                set.close();
                                return Err(PoolError::Cancelled);
                            }
                        }
                    }
                }
            };

            set.listeners.push(listener);
        }

        Ok(set)
    }

    /// Clones of every listener handle, for one acceptor.
    pub fn handles(&self) -> Vec<SharedListener> {
        self.listeners.clone()
    }

    /// Bound addresses, keyed by mapping key.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.key().to_string(), l.local_addr()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Release every socket.
    ///
    /// Acceptors must have exited first; a listener still referenced elsewhere
    /// stays open until that reference drops.
    pub fn close(&mut self) {
        for listener in self.listeners.drain(..) {
            let outstanding = Arc::strong_count(&listener.fd) - 1;
            if outstanding > 0 {
                warn!(
                    listen = %listener.key,
                    outstanding,
                    "Listener still referenced at close"
                );
            } else {
                debug!(listen = %listener.key, "Listener closed");
            }
        }
    }
}

impl Drop for SharedListenerSet {
    fn drop(&mut self) {
        self.close();
    }
}
