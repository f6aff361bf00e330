//! golive-lbr library.
//!
//! A TCP load balancer: mapping configuration, shared listeners, an acceptor
//! pool with round-robin dispatch, relay workers, and connect-failure failover.

pub mod balancer;
pub mod config;
pub mod error;
pub mod mapping;

pub use balancer::{AcceptorPool, PoolHealth, PoolSettings, PoolStats, ShutdownTrigger};
pub use error::{ConfigError, PoolError, RelayError};
pub use mapping::{BackendTarget, ConfigWarning, LbOptions, Mapping, MappingStore, ReloadOutcome};
