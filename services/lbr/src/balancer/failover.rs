//! Failover monitor.
//!
//! Periodically scans the registry for workers whose backend connect failed,
//! takes the parked client connection and starts a new worker for it on a
//! different backend. With a single backend the same one is retried.

use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::seq::IndexedRandom;
use rand::Rng;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::relay::{RelayContext, RelayWorker};
use super::wait_for_shutdown;
use crate::mapping::{BackendTarget, Mapping};

/// Pick the backend for a reassigned connection.
///
/// Chooses uniformly among backends other than `failed`. When `failed` is the
/// only backend it is chosen again. Returns `None` for an empty mapping.
pub fn choose_backend<R: Rng + ?Sized>(
    mapping: &Mapping,
    failed: &BackendTarget,
    rng: &mut R,
) -> Option<BackendTarget> {
    let alternatives: Vec<&BackendTarget> = mapping
        .backends()
        .iter()
        .filter(|backend| *backend != failed)
        .collect();

    match alternatives.choose(rng) {
        Some(backend) => Some((*backend).clone()),
        None => mapping.backends().first().cloned(),
    }
}

/// Whether the client closed or reset a parked connection.
///
/// Peeks without consuming, so bytes the client already sent stay queued for
/// the next worker.
fn client_departed(stream: &TcpStream) -> bool {
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(stream).peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
        Err(_) => true,
    }
}

/// Reassigns connections whose backend connect failed.
pub struct FailoverMonitor {
    relay: RelayContext,
    interval: Duration,
}

impl FailoverMonitor {
    pub fn new(relay: RelayContext, interval: Duration) -> Self {
        Self { relay, interval }
    }

    /// Scan every `interval` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting failover monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scan_once().await;
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Failover monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Reassign every failed worker once. Returns how many were reassigned.
    pub async fn scan_once(&self) -> usize {
        let mut reassigned = 0;

        for record in self.relay.registry().failed().await {
            if !record.claim_failed() {
                continue;
            }
            let Some(conn) = record.take_parked().await else {
                record.release();
                continue;
            };

            if client_departed(&conn.stream) {
                debug!(
                    worker_id = record.id(),
                    peer = %record.client_addr(),
                    attempt = record.attempt(),
                    "Client left while awaiting a backend, dropping connection"
                );
                drop(conn);
                record.release();
                continue;
            }

            let key = record.mapping_key().to_string();
            let next = self
                .relay
                .store()
                .get(&key)
                .and_then(|mapping| choose_backend(&mapping, record.backend(), &mut rand::rng()));

            let Some(backend) = next else {
                warn!(
                    listen = %key,
                    peer = %record.client_addr(),
                    "Mapping no longer has backends, closing client"
                );
                drop(conn);
                record.release();
                continue;
            };

            if &backend == record.backend() {
                debug!(
                    worker_id = record.id(),
                    backend = %backend,
                    "Retrying the only backend"
                );
            }
            info!(
                worker_id = record.id(),
                peer = %record.client_addr(),
                failed_backend = %record.backend(),
                backend = %backend,
                attempt = record.attempt() + 1,
                "Reassigning connection"
            );

            self.relay.stats().failovers.fetch_add(1, Ordering::Relaxed);
            RelayWorker::spawn(&self.relay, conn, &key, backend, record.attempt() + 1).await;

            // The old worker retires; the reaper removes its record.
            record.release();
            reassigned += 1;
        }

        reassigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{ActiveWorker, Connection, ConnectStatus, PoolStats, WorkerRegistry};
    use crate::mapping::MappingStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const LISTEN_KEY: &str = "127.0.0.1:9";

    /// Monitor over a single-backend mapping whose backend refuses connections.
    fn monitor() -> (FailoverMonitor, watch::Sender<bool>, u16) {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let text = format!("[mappings]\n{LISTEN_KEY} = 127.0.0.1:{dead_port}\n");
        let (store, _) = MappingStore::load(&text).unwrap();
        let (tx, shutdown) = watch::channel(false);
        let relay = RelayContext::new(
            Arc::new(WorkerRegistry::new()),
            Arc::new(store),
            Arc::new(PoolStats::default()),
            Duration::from_millis(200),
            Duration::from_secs(5),
            shutdown,
        );
        (FailoverMonitor::new(relay, Duration::from_secs(60)), tx, dead_port)
    }

    async fn parked(monitor: &FailoverMonitor, backend_port: u16) -> (Arc<ActiveWorker>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        let record = monitor
            .relay
            .registry()
            .register(
                peer_addr,
                LISTEN_KEY,
                BackendTarget::new("127.0.0.1", backend_port),
                1,
            )
            .await;
        record.park_failed(Connection { stream, peer_addr }).await;
        (record, client)
    }

    fn mapping(ports: &[u16]) -> Mapping {
        Mapping::new(
            "0.0.0.0",
            1,
            ports
                .iter()
                .map(|p| BackendTarget::new("10.0.0.1", *p))
                .collect(),
        )
    }

    #[test]
    fn test_choose_excludes_failed_backend() {
        let mapping = mapping(&[1, 2, 3]);
        let failed = BackendTarget::new("10.0.0.1", 2);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let picked = choose_backend(&mapping, &failed, &mut rng).unwrap();
            assert_ne!(picked, failed);
        }
    }

    #[test]
    fn test_choose_reaches_every_alternative() {
        let mapping = mapping(&[1, 2, 3]);
        let failed = BackendTarget::new("10.0.0.1", 1);
        let mut rng = StdRng::seed_from_u64(42);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(choose_backend(&mapping, &failed, &mut rng).unwrap().port);
        }
        assert_eq!(seen, HashSet::from([2, 3]));
    }

    #[test]
    fn test_choose_single_backend_retries_same() {
        let mapping = mapping(&[9]);
        let failed = BackendTarget::new("10.0.0.1", 9);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(choose_backend(&mapping, &failed, &mut rng), Some(failed));
    }

    #[test]
    fn test_choose_after_failed_backend_removed() {
        let single = mapping(&[4]);
        let failed = BackendTarget::new("10.0.0.1", 9);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            choose_backend(&single, &failed, &mut rng),
            Some(BackendTarget::new("10.0.0.1", 4))
        );
        assert_eq!(choose_backend(&mapping(&[]), &failed, &mut rng), None);
    }

    #[tokio::test]
    async fn test_scan_reassigns_waiting_client() {
        let (monitor, _tx, dead_port) = monitor();
        let (record, mut client) = parked(&monitor, dead_port).await;
        client.write_all(b"early").await.unwrap();

        assert_eq!(monitor.scan_once().await, 1);
        assert_eq!(record.status(), ConnectStatus::Reassigned);
        assert_eq!(monitor.relay.stats().failovers.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.relay.registry().len().await, 2);
    }

    #[tokio::test]
    async fn test_scan_drops_departed_client() {
        let (monitor, _tx, dead_port) = monitor();
        let (record, client) = parked(&monitor, dead_port).await;
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(monitor.scan_once().await, 0);
        assert_eq!(record.status(), ConnectStatus::Reassigned);
        assert_eq!(monitor.relay.stats().failovers.load(Ordering::Relaxed), 0);
        // No replacement worker was spawned.
        assert_eq!(monitor.relay.registry().len().await, 1);
        assert!(record.take_parked().await.is_none());
    }

    #[tokio::test]
    async fn test_departure_check_keeps_pending_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        assert!(!client_departed(&stream));
        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pending data wins over the half-close, and peeking consumes nothing.
        assert!(!client_departed(&stream));
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"abc");
        assert!(client_departed(&stream));
    }
}
