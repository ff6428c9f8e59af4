//! Admission control for client traffic
//!
//! The guard tracks, per client IP, the number of open connections, the
//! number of requests served and the amount of data transferred. A client that
//! exceeds any one of the configured limits is rejected until the counters
//! are cleared.
//!
//! # Architecture
//!
//! - Connection counts follow connect/disconnect events and are never cleared
//! - Byte and request counters grow until [`DosGuard::clear`] empties them;
//!   the [`Sweeper`] task does this on a fixed interval
//! - Whitelisted clients are never counted and never rejected
//!
//! All per-IP state sits behind one mutex. Critical sections only touch the
//! maps; logging happens after the lock is released.
//!
//! # Example
//!
//! ```
//! use relay_common::dos_guard::{DosGuard, DosGuardConfig};
//!
//! let guard = DosGuard::new(DosGuardConfig {
//!     max_requests: 2,
//!     ..Default::default()
//! });
//!
//! assert!(guard.record_request("10.0.0.1"));
//! assert!(guard.record_request("10.0.0.1"));
//! assert!(!guard.record_request("10.0.0.1"));
//!
//! guard.clear();
//! assert!(guard.is_allowed("10.0.0.1"));
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_FETCHES: u64 = 1_000_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_MAX_REQUESTS: u64 = 20;
pub const DEFAULT_SWEEP_INTERVAL_SECS: f64 = 1.0;

/// Admission limits.
///
/// A client is rejected as soon as any single counter is strictly greater
/// than its limit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DosGuardConfig {
    /// Maximum bytes transferred per client between sweeps
    pub max_fetches: u64,
    /// Maximum concurrent connections per client
    pub max_connections: u32,
    /// Maximum requests per client between sweeps
    pub max_requests: u64,
    /// Client IPs exempt from all accounting
    pub whitelist: Vec<String>,
    /// How often the sweeper clears byte and request counters
    pub sweep_interval_secs: f64,
}

impl Default for DosGuardConfig {
    fn default() -> Self {
        Self {
            max_fetches: DEFAULT_MAX_FETCHES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_requests: DEFAULT_MAX_REQUESTS,
            whitelist: Vec::new(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl DosGuardConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_secs)
    }
}

/// Set of client identities exempt from admission control.
///
/// Membership is exact and case-sensitive.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: HashSet<String>,
}

impl Whitelist {
    pub fn contains(&self, ip: &str) -> bool {
        self.entries.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Whitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Cumulative per-client counters, reset by [`DosGuard::clear`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounters {
    pub transferred_bytes: u64,
    pub request_count: u64,
}

/// Which limit a client exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violation {
    Bytes(u64),
    Requests(u64),
    Connections(u32),
}

#[derive(Debug, Default)]
struct GuardState {
    counters: HashMap<String, ClientCounters>,
    connections: HashMap<String, u32>,
}

/// Per-client admission guard.
///
/// Safe to share across tasks behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct DosGuard {
    whitelist: Whitelist,
    max_fetches: u64,
    max_connections: u32,
    max_requests: u64,
    state: Mutex<GuardState>,
}

impl DosGuard {
    pub fn new(config: DosGuardConfig) -> Self {
        Self {
            whitelist: config.whitelist.iter().map(String::as_str).collect(),
            max_fetches: config.max_fetches,
            max_connections: config.max_connections,
            max_requests: config.max_requests,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    /// Whether the client is currently within all limits.
    pub fn is_allowed(&self, ip: &str) -> bool {
        if self.is_whitelisted(ip) {
            return true;
        }

        let violation = {
            let state = self.state.lock();
            let counters = state.counters.get(ip).copied().unwrap_or_default();
            let connections = state.connections.get(ip).copied().unwrap_or(0);
            self.check_limits(counters, connections)
        };

        match violation {
            None => true,
            Some(Violation::Bytes(bytes)) => {
                warn!(ip, transferred_bytes = bytes, "client surpassed the transfer limit");
                false
            }
            Some(Violation::Requests(requests)) => {
                warn!(ip, requests, "client surpassed the request limit");
                false
            }
            Some(Violation::Connections(connections)) => {
                warn!(ip, connections, "client surpassed the connection limit");
                false
            }
        }
    }

    fn check_limits(&self, counters: ClientCounters, connections: u32) -> Option<Violation> {
        if counters.transferred_bytes > self.max_fetches {
            Some(Violation::Bytes(counters.transferred_bytes))
        } else if counters.request_count > self.max_requests {
            Some(Violation::Requests(counters.request_count))
        } else if connections > self.max_connections {
            Some(Violation::Connections(connections))
        } else {
            None
        }
    }

    /// Records a new connection from `ip`.
    pub fn on_connect(&self, ip: &str) {
        if self.is_whitelisted(ip) {
            return;
        }
        let mut state = self.state.lock();
        *state.connections.entry(ip.to_string()).or_insert(0) += 1;
    }

    /// Records a closed connection from `ip`.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when `ip` has no open connection: connect and
    /// disconnect events are unbalanced upstream.
    pub fn on_disconnect(&self, ip: &str) {
        if self.is_whitelisted(ip) {
            return;
        }

        let balanced = {
            let mut state = self.state.lock();
            match state.connections.get_mut(ip) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        state.connections.remove(ip);
                    }
                    true
                }
                None => false,
            }
        };

        if !balanced {
            error!(ip, "disconnect without a matching connect");
            debug_assert!(balanced, "connection count for {} can't be 0", ip);
        }
    }

    /// Adds `bytes` to the client's transfer counter and reports whether the
    /// client is still allowed.
    pub fn record_bytes(&self, ip: &str, bytes: u64) -> bool {
        if self.is_whitelisted(ip) {
            return true;
        }
        {
            let mut state = self.state.lock();
            let counters = state.counters.entry(ip.to_string()).or_default();
            counters.transferred_bytes = counters.transferred_bytes.saturating_add(bytes);
        }
        self.is_allowed(ip)
    }

    /// Counts one request for the client and reports whether the client is
    /// still allowed.
    pub fn record_request(&self, ip: &str) -> bool {
        if self.is_whitelisted(ip) {
            return true;
        }
        {
            let mut state = self.state.lock();
            let counters = state.counters.entry(ip.to_string()).or_default();
            counters.request_count = counters.request_count.saturating_add(1);
        }
        self.is_allowed(ip)
    }

    /// Empties all byte and request counters. Connection counts are kept.
    pub fn clear(&self) {
        self.state.lock().counters.clear();
    }

    /// Open connections currently recorded for `ip`.
    pub fn connection_count(&self, ip: &str) -> u32 {
        self.state.lock().connections.get(ip).copied().unwrap_or(0)
    }

    /// Byte and request counters currently recorded for `ip`.
    pub fn client_counters(&self, ip: &str) -> ClientCounters {
        self.state.lock().counters.get(ip).copied().unwrap_or_default()
    }

    /// Number of clients with any recorded state.
    pub fn tracked_client_count(&self) -> usize {
        let state = self.state.lock();
        state
            .counters
            .keys()
            .chain(state.connections.keys())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Background task clearing a guard's counters on a fixed interval.
pub struct Sweeper {
    guard: Arc<DosGuard>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(guard: Arc<DosGuard>, interval: Duration) -> Self {
        Self { guard, interval }
    }

    /// Starts the sweeper task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.guard.clear();
            debug!("dos guard counters cleared");
        }
    }
}
