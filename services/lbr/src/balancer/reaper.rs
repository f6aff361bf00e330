//! Periodic removal of finished relay workers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::pool::PoolStats;
use super::registry::WorkerRegistry;
use super::wait_for_shutdown;

pub struct ReaperLoop {
    registry: Arc<WorkerRegistry>,
    stats: Arc<PoolStats>,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(registry: Arc<WorkerRegistry>, stats: Arc<PoolStats>, interval: Duration) -> Self {
        Self {
            registry,
            stats,
            interval,
        }
    }

    /// Reap every `interval` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reaper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_once().await;
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Remove finished workers once. Returns how many were removed.
    pub async fn reap_once(&self) -> usize {
        let reaped = self.registry.reap().await;
        if reaped > 0 {
            self.stats
                .workers_reaped
                .fetch_add(reaped as u64, Ordering::Relaxed);
            let remaining = self.registry.len().await;
            debug!(reaped, remaining, "Reaped finished workers");
        }
        reaped
    }
}
