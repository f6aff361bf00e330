//! Relay workers.
//!
//! A relay worker owns one client connection. It connects to its backend and
//! copies bytes in both directions until either side closes, errors, or
//! shutdown is requested. If the backend connect fails the client connection
//! is parked on the worker's record for the failover monitor.

use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument};

use super::listener::Connection;
use super::pool::PoolStats;
use super::registry::{ActiveWorker, WorkerRegistry};
use super::{is_shutting_down, wait_for_shutdown};
use crate::error::RelayError;
use crate::mapping::{BackendTarget, MappingStore};

/// Everything a relay worker needs besides its connection.
#[derive(Clone)]
pub struct RelayContext {
    registry: Arc<WorkerRegistry>,
    store: Arc<MappingStore>,
    stats: Arc<PoolStats>,
    connect_timeout: Duration,
    connect_failure_grace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RelayContext {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<MappingStore>,
        stats: Arc<PoolStats>,
        connect_timeout: Duration,
        connect_failure_grace: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            store,
            stats,
            connect_timeout,
            connect_failure_grace,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }
}

/// Marks the record finished when the worker future ends, including on abort.
struct FinishGuard(Arc<ActiveWorker>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// One client connection being relayed to one backend.
pub struct RelayWorker {
    record: Arc<ActiveWorker>,
    conn: Connection,
    ctx: RelayContext,
}

impl RelayWorker {
    /// Register and spawn a worker for `conn`.
    pub async fn spawn(
        ctx: &RelayContext,
        conn: Connection,
        mapping_key: &str,
        backend: BackendTarget,
        attempt: u32,
    ) -> Arc<ActiveWorker> {
        let record = ctx
            .registry
            .register(conn.peer_addr, mapping_key, backend, attempt)
            .await;

        let span = info_span!(
            "relay",
            worker_id = record.id(),
            peer = %record.client_addr(),
            backend = %record.backend(),
            attempt,
        );
        let worker = RelayWorker {
            record: Arc::clone(&record),
            conn,
            ctx: ctx.clone(),
        };
        let handle = tokio::spawn(worker.run().instrument(span));
        ctx.registry.attach(record.id(), handle).await;

        record
    }

    async fn run(self) {
        let RelayWorker { record, conn, ctx } = self;
        let _finished = FinishGuard(Arc::clone(&record));
        let mut shutdown = ctx.shutdown.clone();

        if is_shutting_down(&shutdown) {
            return;
        }

        let connected = tokio::select! {
            result = connect_backend(record.backend(), ctx.connect_timeout) => result,
            _ = wait_for_shutdown(&mut shutdown) => return,
        };

        let backend = match connected {
            Ok(stream) => {
                ctx.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(e) => {
                ctx.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Backend connection failed");

                // Keep the client open for the failover monitor.
                record.park_failed(conn).await;
                tokio::select! {
                    _ = record.released() => {}
                    _ = tokio::time::sleep(ctx.connect_failure_grace) => {}
                    _ = wait_for_shutdown(&mut shutdown) => {}
                }
                return;
            }
        };

        debug!("Connected to backend");

        let Connection { stream: mut client, .. } = conn;
        let mut backend = backend;
        let buffer_size = ctx.store.options().buffer_size;

        let outcome =
            relay_bidirectional(&mut client, &mut backend, buffer_size, &mut shutdown).await;

        ctx.stats
            .bytes_to_backend
            .fetch_add(outcome.to_backend, Ordering::Relaxed);
        ctx.stats
            .bytes_from_backend
            .fetch_add(outcome.from_backend, Ordering::Relaxed);
        ctx.stats.relays_completed.fetch_add(1, Ordering::Relaxed);

        match &outcome.end {
            RelayEnd::Error(e) => debug!(
                error = %e,
                bytes_to_backend = outcome.to_backend,
                bytes_from_backend = outcome.from_backend,
                "Relay ended with error"
            ),
            end => debug!(
                end = ?end,
                bytes_to_backend = outcome.to_backend,
                bytes_from_backend = outcome.from_backend,
                "Connection closed"
            ),
        }

        close_quietly(&client);
        close_quietly(&backend);
    }
}

/// Connect to a backend, bounded by `connect_timeout`.
async fn connect_backend(
    backend: &BackendTarget,
    connect_timeout: Duration,
) -> Result<TcpStream, RelayError> {
    debug!(backend = %backend, "Connecting to backend");

    match timeout(
        connect_timeout,
        TcpStream::connect((backend.address.as_str(), backend.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RelayError::Connect {
            backend: backend.clone(),
            source,
        }),
        Err(_) => Err(RelayError::ConnectTimeout {
            backend: backend.clone(),
            timeout: connect_timeout,
        }),
    }
}

/// Shut down both directions, ignoring errors from already-closed peers.
fn close_quietly(stream: &TcpStream) {
    let _ = SockRef::from(stream).shutdown(Shutdown::Both);
}

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client sent EOF.
    ClientClosed,
    /// The backend sent EOF.
    BackendClosed,
    /// Shutdown was requested.
    Shutdown,
    /// Reset, broken pipe, or another IO error on either side.
    Error(io::Error),
}

/// Result of [`relay_bidirectional`].
#[derive(Debug)]
pub struct RelayOutcome {
    pub to_backend: u64,
    pub from_backend: u64,
    pub end: RelayEnd,
}

/// Copy bytes between `client` and `backend` until either side ends.
///
/// Each direction reads chunks of up to `buffer_size` and writes every chunk
/// out before reading again, so byte order per direction is preserved. The
/// two directions are independent. EOF or an error on either side ends both.
pub async fn relay_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    buffer_size: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> RelayOutcome {
    let (client_read, client_write) = client.split();
    let (backend_read, backend_write) = backend.split();

    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let end = tokio::select! {
        result = pump(client_read, backend_write, buffer_size, &to_backend) => match result {
            Ok(()) => RelayEnd::ClientClosed,
            Err(e) => RelayEnd::Error(e),
        },
        result = pump(backend_read, client_write, buffer_size, &from_backend) => match result {
            Ok(()) => RelayEnd::BackendClosed,
            Err(e) => RelayEnd::Error(e),
        },
        _ = wait_for_shutdown(shutdown) => RelayEnd::Shutdown,
    };

    RelayOutcome {
        to_backend: to_backend.load(Ordering::Relaxed),
        from_backend: from_backend.load(Ordering::Relaxed),
        end,
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize, total: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::bind_listener;
    use tokio::net::TcpListener;

    /// A listener that never accepts, with its accept queue filled so
    /// further connects hang. `None` if the queue never filled.
    async fn saturated_listener() -> Option<(std::net::TcpListener, Vec<TcpStream>, u16)> {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut held = Vec::new();
        for _ in 0..64 {
            match timeout(
                Duration::from_millis(200),
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await
            {
                Ok(Ok(stream)) => held.push(stream),
                Ok(Err(_)) => return None,
                Err(_) => return Some((listener, held, port)),
            }
        }
        None
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let outer = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (inner, _) = listener.accept().await.unwrap();
        (outer, inner)
    }

    #[tokio::test]
    async fn test_relay_preserves_order_with_small_buffer() {
        let (mut client_app, mut client_side) = pair().await;
        let (mut backend_side, mut backend_app) = pair().await;
        let (_tx, mut shutdown) = watch::channel(false);

        let relay = tokio::spawn(async move {
            relay_bidirectional(&mut client_side, &mut backend_side, 3, &mut shutdown).await
        });

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(777) {
                client_app.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client_app
        });

        let mut received = vec![0u8; expected.len()];
        backend_app.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        backend_app.write_all(b"reply").await.unwrap();
        let mut client_app = writer.await.unwrap();
        let mut reply = [0u8; 5];
        client_app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(client_app);
        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::ClientClosed));
        assert_eq!(outcome.to_backend, 10_000);
        assert_eq!(outcome.from_backend, 5);
    }

    #[tokio::test]
    async fn test_relay_ends_on_backend_eof() {
        let (_client_app, mut client_side) = pair().await;
        let (mut backend_side, backend_app) = pair().await;
        let (_tx, mut shutdown) = watch::channel(false);

        drop(backend_app);
        let outcome =
            relay_bidirectional(&mut client_side, &mut backend_side, 16, &mut shutdown).await;
        assert!(matches!(
            outcome.end,
            RelayEnd::BackendClosed | RelayEnd::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let (_client_app, mut client_side) = pair().await;
        let (mut backend_side, _backend_app) = pair().await;
        let (tx, mut shutdown) = watch::channel(false);

        let relay = tokio::spawn(async move {
            relay_bidirectional(&mut client_side, &mut backend_side, 16, &mut shutdown).await
        });
        tx.send_replace(true);

        let outcome = timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome.end, RelayEnd::Shutdown));
    }

    #[tokio::test]
    async fn test_connect_backend_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_backend(
            &BackendTarget::new("127.0.0.1", port),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.is_connect_failure());
    }

    #[tokio::test]
    async fn test_connect_backend_times_out() {
        let Some((_listener, _held, port)) = saturated_listener().await else {
            eprintln!("accept queue did not fill on this host, skipping");
            return;
        };

        let started = tokio::time::Instant::now();
        let err = connect_backend(
            &BackendTarget::new("127.0.0.1", port),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RelayError::ConnectTimeout { timeout, .. } if timeout == Duration::from_millis(100)
        ));
        assert!(err.is_connect_failure());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
