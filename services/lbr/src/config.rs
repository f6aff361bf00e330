//! Process configuration.
//!
//! The mapping file is read by [`MappingStore`](crate::mapping::MappingStore).
//! Everything else comes from flags, each with an environment fallback.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::balancer::PoolSettings;

/// Smallest accepted interval or timeout.
const MIN_MILLIS: u64 = 10;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// TCP load balancer.
#[derive(Debug, Clone, Parser)]
#[command(name = "lbr")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the mapping file.
    #[arg(long, short = 'c', env = "LBR_CONFIG")]
    pub config: PathBuf,

    /// Number of acceptor tasks sharing the listening sockets.
    #[arg(long, env = "LBR_ACCEPTORS")]
    pub acceptors: Option<usize>,

    /// Backend connect timeout (milliseconds).
    #[arg(long, env = "LBR_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// How long a worker holds a client socket after its backend connect fails (milliseconds).
    #[arg(long, env = "LBR_CONNECT_FAILURE_GRACE_MS", default_value_t = 6000)]
    pub connect_failure_grace_ms: u64,

    /// Failover monitor scan interval (milliseconds).
    #[arg(long, env = "LBR_FAILOVER_INTERVAL_MS", default_value_t = 2000)]
    pub failover_interval_ms: u64,

    /// Reaper scan interval (milliseconds).
    #[arg(long, env = "LBR_REAP_INTERVAL_MS", default_value_t = 1500)]
    pub reap_interval_ms: u64,

    /// Delay between bind attempts (milliseconds).
    #[arg(long, env = "LBR_BIND_RETRY_MS", default_value_t = 5000)]
    pub bind_retry_ms: u64,

    /// Upper bound on each acceptor readiness wait (milliseconds).
    #[arg(long, env = "LBR_ACCEPT_POLL_MS", default_value_t = 1000)]
    pub accept_poll_ms: u64,

    /// Time given to acceptors and relays to finish on shutdown (milliseconds).
    #[arg(long, env = "LBR_SHUTDOWN_GRACE_MS", default_value_t = 3000)]
    pub shutdown_grace_ms: u64,

    /// Listen backlog.
    #[arg(long, env = "LBR_BACKLOG", default_value_t = 128)]
    pub backlog: i32,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "LBR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LBR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Acceptor count, defaulting to the available parallelism.
    pub fn acceptor_count(&self) -> usize {
        self.acceptors
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    /// Pool settings derived from the flags.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            num_acceptors: self.acceptor_count(),
            connect_timeout: millis(self.connect_timeout_ms),
            connect_failure_grace: millis(self.connect_failure_grace_ms),
            failover_interval: millis(self.failover_interval_ms),
            reap_interval: millis(self.reap_interval_ms),
            bind_retry: millis(self.bind_retry_ms),
            accept_poll: millis(self.accept_poll_ms),
            shutdown_grace: millis(self.shutdown_grace_ms),
            backlog: self.backlog.max(1),
        }
    }
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value.max(MIN_MILLIS))
}
