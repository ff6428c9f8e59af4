use async_trait::async_trait;
use relay_common::protocol::error::{RelayError, Result};
use relay_common::protocol::JsonObject;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Ledger returned by an upstream source.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerResponse {
    pub sequence: u32,
    /// Whether the upstream considers this ledger validated
    pub validated: bool,
    /// Upstream payload, passed through untouched
    pub payload: JsonObject,
}

/// Public status of a source, as exposed by diagnostics endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub url: String,
    pub connected: bool,
    /// Ledger ranges the upstream advertises, e.g. `"32570-100000"`
    pub validated_ledgers: String,
    /// Highest advertised sequence
    pub latest_ledger: Option<u32>,
    /// Seconds since the last successful exchange with the upstream
    pub last_message_age_secs: Option<u64>,
    /// Failed probes since the last successful one
    pub reconnect_attempts: usize,
}

/// An upstream ledger-data provider.
///
/// Connectivity and ledger availability are plain state reads: they must
/// never wait on the network. Reconnection is the source's own business and
/// runs in the background after [`Source::run`].
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable identity, typically the upstream URL.
    fn describe(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Whether the upstream advertises `sequence` as available.
    fn has_ledger(&self, sequence: u32) -> bool;

    /// Fetches one ledger, optionally with its changed objects and their
    /// neighbours.
    async fn fetch_ledger(
        &self,
        sequence: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<LedgerResponse>;

    /// Downloads the full state of ledger `sequence`, using up to
    /// `num_markers` concurrent cursors.
    async fn load_initial_ledger(
        &self,
        sequence: u32,
        num_markers: u32,
        cache_only: bool,
    ) -> Result<Vec<String>>;

    /// Forwards a client request verbatim. `None` on any failure.
    async fn forward_request(&self, request: &JsonObject, client_ip: &str) -> Option<JsonObject>;

    fn status(&self) -> SourceStatus;

    /// Starts the background connection loop.
    fn run(self: Arc<Self>) {}

    /// Stops the background connection loop.
    fn stop(&self) {}
}

/// Set of ledger sequence ranges advertised by an upstream.
///
/// Parsed from strings like `"32570-100000,100002,100010-100020"`. The
/// literal `"empty"` denotes no ledgers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerRanges {
    ranges: Vec<(u32, u32)>,
}

impl LedgerRanges {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() || input == "empty" {
            return Ok(Self::default());
        }

        let mut ranges = input
            .split(',')
            .map(|part| parse_range(part.trim()))
            .collect::<Result<Vec<_>>>()?;
        ranges.sort_unstable();

        Ok(Self { ranges })
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.ranges
            .iter()
            .any(|&(min, max)| min <= sequence && sequence <= max)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Highest advertised sequence.
    pub fn max_sequence(&self) -> Option<u32> {
        self.ranges.iter().map(|&(_, max)| max).max()
    }
}

fn parse_range(part: &str) -> Result<(u32, u32)> {
    let invalid = || RelayError::InvalidResponse(format!("invalid ledger range '{}'", part));

    let (min, max) = match part.split_once('-') {
        Some((min, max)) => (
            min.trim().parse::<u32>().map_err(|_| invalid())?,
            max.trim().parse::<u32>().map_err(|_| invalid())?,
        ),
        None => {
            let seq = part.parse::<u32>().map_err(|_| invalid())?;
            (seq, seq)
        }
    };

    if min > max {
        return Err(invalid());
    }
    Ok((min, max))
}

impl fmt::Display for LedgerRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "empty");
        }
        for (i, &(min, max)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if min == max {
                write!(f, "{}", min)?;
            } else {
                write!(f, "{}-{}", min, max)?;
            }
        }
        Ok(())
    }
}
