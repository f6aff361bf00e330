//! golive-lbr
//!
//! TCP load balancer.
//!
//! This service:
//! - Reads listen-address to backend mappings from an INI-style file
//! - Binds every listen address once and shares it across N acceptors
//! - Dispatches connections round-robin and relays bytes both ways
//! - Moves connections whose backend connect failed to another backend
//! - Reloads mappings on SIGHUP and drains on SIGTERM or SIGINT

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use golive_lbr::config::{Config, LogFormat};
use golive_lbr::{AcceptorPool, MappingStore, PoolHealth, ShutdownTrigger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting golive-lbr");

    let (store, warnings) = MappingStore::load_file(&config.config)
        .with_context(|| format!("failed to load mappings from {}", config.config.display()))?;
    let settings = config.pool_settings();
    info!(
        config = %config.config.display(),
        mapping_count = store.len(),
        warning_count = warnings.len(),
        acceptors = settings.num_acceptors,
        connect_timeout_ms = settings.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let store = Arc::new(store);
    let pool = AcceptorPool::new(Arc::clone(&store), settings);

    let signals = tokio::spawn(handle_signals(
        pool.shutdown_trigger(),
        Arc::clone(&store),
        config.config.clone(),
    ));
    tokio::spawn(log_health(pool.health()));

    match pool.setup().await {
        Ok(()) => {
            pool.wait_for_shutdown_signal().await;
        }
        Err(golive_lbr::PoolError::Cancelled) => {
            info!("Shutdown requested during startup");
        }
        Err(e) => {
            error!(error = %e, "Failed to start acceptor pool");
            return Err(e.into());
        }
    }

    pool.shutdown().await;
    signals.abort();

    info!("golive-lbr stopped");
    Ok(())
}

/// SIGTERM and SIGINT stop the pool. SIGHUP reloads the mapping file.
async fn handle_signals(trigger: ShutdownTrigger, store: Arc<MappingStore>, path: PathBuf) {
    let (mut sigterm, mut sigint, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers, stopping");
            trigger.fire();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                trigger.fire();
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                trigger.fire();
            }
            _ = sighup.recv() => {
                info!(config = %path.display(), "Received SIGHUP, reloading mappings");
                match Arc::clone(&store).reload_file_in_background(path.clone()).await {
                    Ok(outcome) => {
                        if !outcome.added.is_empty() {
                            warn!(
                                added = ?outcome.added,
                                "New listen addresses are not bound until restart"
                            );
                        }
                        if !outcome.removed.is_empty() {
                            warn!(
                                removed = ?outcome.removed,
                                "Removed listen addresses now close new connections"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Reload failed, keeping previous mappings"),
                }
            }
        }
    }
}

async fn log_health(mut health: tokio::sync::watch::Receiver<PoolHealth>) {
    while health.changed().await.is_ok() {
        let current = health.borrow_and_update().clone();
        match current {
            PoolHealth::BindRetrying {
                listen,
                attempt,
                error,
            } => warn!(listen = %listen, attempt, error = %error, "Pool health: bind retrying"),
            other => info!(health = ?other, "Pool health changed"),
        }
    }
}
