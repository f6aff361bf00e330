//! Error types for the load balancer.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mapping::BackendTarget;

/// Fatal configuration errors.
///
/// Individual malformed lines are not errors; they are reported as
/// [`ConfigWarning`](crate::mapping::ConfigWarning)s and skipped.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required section is absent from the configuration text.
    #[error("config is missing required \"{0}\" section")]
    MissingSection(&'static str),

    /// The configuration file could not be read.
    #[error("could not open config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while starting or running the acceptor pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Shutdown was requested before the pool finished starting.
    #[error("pool startup cancelled by shutdown")]
    Cancelled,

    /// The mapping store produced no front-end address to listen on.
    #[error("no listen addresses configured")]
    NoListeners,

    /// `setup` was called on a pool that is already running or stopped.
    #[error("pool already started")]
    AlreadyStarted,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Per-connection relay errors. Contained to a single worker.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The backend did not accept the connection within the connect timeout.
    #[error("connect to {backend} timed out after {timeout:?}")]
    ConnectTimeout {
        backend: BackendTarget,
        timeout: Duration,
    },

    /// The backend refused or was unreachable.
    #[error("could not connect to {backend}: {source}")]
    Connect {
        backend: BackendTarget,
        #[source]
        source: io::Error,
    },

    /// IO error while relaying.
    #[error("relay io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether this error happened before the relay phase began.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectTimeout { .. } | RelayError::Connect { .. }
        )
    }
}
