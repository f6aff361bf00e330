
use std::sync::atomic::Ordering;
use std::time::Duration;

use golive_lbr::PoolSettings;
use harness::{
    eventually, fast_settings, free_port, roundtrip, HangingBackend, LbHandle, TcpBackend,
};
use tokio::time::timeout;

#[tokio::test]
async fn failed_connect_is_reassigned_to_live_backend() {
    let dead = free_port();
    let live = TcpBackend::marker("PONG").await.unwrap();
    // One acceptor: the first connection goes to the dead backend.
    let lb = LbHandle::spawn(&[dead, live.port()], fast_settings(1)).await;

    let reply = timeout(Duration::from_secs(3), roundtrip(lb.listen_addr, b"PING", 4))
        .await
        .expect("client was not reassigned in time")
        .unwrap();

    assert_eq!(reply, b"PONG");
    let stats = lb.pool.stats();
    assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.failovers.load(Ordering::Relaxed), 1);
    assert_eq!(live.connection_count(), 1);
    lb.pool.shutdown().await;
}

#[tokio::test]
async fn single_backend_is_retried_until_it_comes_up() {
    let port = free_port();
    let lb = LbHandle::spawn(&[port], fast_settings(1)).await;

    let client = tokio::spawn({
        let addr = lb.listen_addr;
        async move { roundtrip(addr, b"hello", 5).await }
    });

    let stats = std::sync::Arc::clone(lb.pool.stats());
    assert!(
        eventually(Duration::from_secs(2), || {
            stats.failovers.load(Ordering::Relaxed) >= 1
        })
        .await
    );

    let backend = TcpBackend::echo_on(port).await.unwrap();
    let reply = timeout(Duration::from_secs(3), client)
        .await
        .expect("client was never connected")
        .unwrap()
        .unwrap();

    assert_eq!(reply, b"hello");
    assert_eq!(backend.connection_count(), 1);
    lb.pool.shutdown().await;
}

#[tokio::test]
async fn reassigned_records_are_reaped() {
    let dead = free_port();
    let live = TcpBackend::marker("ok").await.unwrap();
    let lb = LbHandle::spawn(&[dead, live.port()], fast_settings(1)).await;

    let reply = roundtrip(lb.listen_addr, b"x", 2).await.unwrap();
    assert_eq!(reply, b"ok");

    // Once the client is gone both the failed and the relaying worker finish.
    let registry = std::sync::Arc::clone(lb.pool.registry());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !registry.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline, "workers were not reaped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lb.pool.stats().workers_reaped.load(Ordering::Relaxed) >= 2);
    lb.pool.shutdown().await;
}

#[tokio::test]
async fn hung_connect_times_out_and_fails_over() {
    let Some(hanging) = HangingBackend::spawn().await else {
        eprintln!("accept queue did not fill on this host, skipping");
        return;
    };
    let live = TcpBackend::marker("PONG").await.unwrap();
    let settings = PoolSettings {
        connect_timeout: Duration::from_millis(200),
        ..fast_settings(1)
    };
    let lb = LbHandle::spawn(&[hanging.port, live.port()], settings).await;

    let started = tokio::time::Instant::now();
    let reply = timeout(Duration::from_secs(3), roundtrip(lb.listen_addr, b"PING", 4))
        .await
        .expect("client was not reassigned after the connect timeout")
        .unwrap();

    assert_eq!(reply, b"PONG");
    assert!(started.elapsed() >= Duration::from_millis(200));
    let stats = lb.pool.stats();
    assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.failovers.load(Ordering::Relaxed), 1);
    assert_eq!(live.connection_count(), 1);
    lb.pool.shutdown().await;
}
