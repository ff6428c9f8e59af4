//! ledger-relay common types
//!
//! This crate holds the pieces shared by the balancer and the binary:
//!
//! - [`protocol`] - Error type and the upstream JSON-RPC envelope
//! - [`config`] - Relay configuration loaded from JSON
//! - [`retry`] - Scheduled retries with pluggable delay strategies
//! - [`dos_guard`] - Per-client admission control
//!
//! Nothing here performs network I/O; transports live in `relay-balancer`.

pub mod config;
pub mod dos_guard;
pub mod protocol;
pub mod retry;

pub use config::{RelayConfig, SourceConfig, SourceRetryConfig};
pub use dos_guard::{DosGuard, DosGuardConfig, Sweeper};
pub use protocol::*;
pub use retry::{ExponentialBackoffStrategy, FixedDelayStrategy, Retry, RetryStrategy};
