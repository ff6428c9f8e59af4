//! Relay configuration
//!
//! The relay reads a single JSON document at startup:
//!
//! ```json
//! {
//!     "etl_sources": [
//!         { "ip": "127.0.0.1", "rpc_port": 51234 }
//!     ],
//!     "num_markers": 16,
//!     "dos_guard": {
//!         "max_fetches": 1000000,
//!         "max_connections": 20,
//!         "max_requests": 20,
//!         "whitelist": ["127.0.0.1"]
//!     }
//! }
//! ```
//!
//! Everything except `etl_sources` is optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dos_guard::DosGuardConfig;
use crate::protocol::error::{RelayError, Result};

/// Lower bound for the initial-download parallelism.
pub const MIN_DOWNLOAD_RANGES: u32 = 1;
/// Upper bound for the initial-download parallelism.
pub const MAX_DOWNLOAD_RANGES: u32 = 256;
/// Parallelism used when ledger history already exists locally.
pub const DOWNLOAD_RANGES_WITH_HISTORY: u32 = 4;
/// Parallelism used for a fresh node without `num_markers`.
pub const DEFAULT_DOWNLOAD_RANGES: u32 = 16;

/// One configured upstream ledger node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceConfig {
    pub ip: String,
    pub rpc_port: u16,
}

impl SourceConfig {
    /// Base URL for JSON-RPC calls to this upstream.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.ip, self.rpc_port)
    }
}

/// Reconnect and request-timeout settings shared by all upstream sources.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceRetryConfig {
    /// Delay before the first reconnect probe, and the polling period while
    /// connected.
    ///
    /// Default: 1000ms
    pub initial_delay_ms: u64,
    /// Cap on the reconnect backoff.
    ///
    /// Default: 30000ms
    pub max_delay_ms: u64,
    /// Timeout applied to every upstream HTTP request.
    ///
    /// Default: 10000ms
    pub request_timeout_ms: u64,
}

impl Default for SourceRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SourceRetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub etl_sources: Vec<SourceConfig>,
    #[serde(default)]
    pub num_markers: Option<u32>,
    #[serde(default)]
    pub dos_guard: DosGuardConfig,
    #[serde(default)]
    pub source_retry: SourceRetryConfig,
}

impl RelayConfig {
    /// Parses and validates a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.etl_sources.is_empty() {
            return Err(RelayError::NoSources);
        }
        if let Some(source) = self.etl_sources.iter().find(|s| s.ip.is_empty()) {
            return Err(RelayError::Config(format!(
                "etl source on port {} has an empty ip",
                source.rpc_port
            )));
        }
        if self.source_retry.initial_delay_ms == 0 {
            return Err(RelayError::Config(
                "source_retry.initial_delay_ms must be > 0".to_string(),
            ));
        }
        if self.source_retry.max_delay_ms < self.source_retry.initial_delay_ms {
            return Err(RelayError::Config(
                "source_retry.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        if self.dos_guard.sweep_interval_secs.is_nan() || self.dos_guard.sweep_interval_secs <= 0.0 {
            return Err(RelayError::Config(
                "dos_guard.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parallelism hint for the initial ledger download.
    ///
    /// `num_markers` wins when present and is clamped to [1, 256]. Otherwise a
    /// node that already holds ledger history uses 4 and a fresh node uses 16.
    pub fn download_ranges(&self, has_ledger_history: bool) -> u32 {
        match self.num_markers {
            Some(n) => n.clamp(MIN_DOWNLOAD_RANGES, MAX_DOWNLOAD_RANGES),
            None if has_ledger_history => DOWNLOAD_RANGES_WITH_HISTORY,
            None => DEFAULT_DOWNLOAD_RANGES,
        }
    }
}
