//! JSON-RPC over HTTP upstream source
//!
//! An [`RpcSource`] owns one HTTP client pointed at an upstream ledger node
//! and keeps a cached view of the node's health: whether it answered its last
//! `server_info` probe and which ledgers it advertises. The load balancer
//! only ever reads that cache.
//!
//! # Probe cycle
//!
//! ```text
//! run() ──► probe ──ok──► connected, ranges refreshed, backoff reset ──┐
//!             ▲                                                        │
//!             │    fail──► disconnected, backoff grows ────────────────┤
//!             │                                                        │
//!             └──────────── Retry timer (initial delay .. max delay) ◄─┘
//! ```
//!
//! While healthy the node is polled every `initial_delay`; after failures the
//! gap doubles up to `max_delay`.

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::{Mutex, RwLock};
use relay_common::config::{SourceConfig, SourceRetryConfig};
use relay_common::protocol::error::{RelayError, Result};
use relay_common::protocol::{JsonObject, UpstreamRequest, UpstreamResponse};
use relay_common::retry::{make_retry_exponential_backoff, Retry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::source::{LedgerRanges, LedgerResponse, Source, SourceStatus};

/// Objects requested per `ledger_data` page.
const LEDGER_DATA_PAGE_LIMIT: u32 = 2048;

#[derive(Debug, Default)]
struct SourceState {
    connected: bool,
    ranges: LedgerRanges,
    last_message: Option<Instant>,
}

/// Upstream ledger node reached through JSON-RPC over HTTP.
pub struct RpcSource {
    url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
    handle: Handle,
    state: RwLock<SourceState>,
    retry: Mutex<Retry>,
    stopped: AtomicBool,
}

impl RpcSource {
    /// Creates a source for `config`. Nothing is sent until [`Source::run`].
    ///
    /// # Errors
    /// [`RelayError::Config`] when called outside a tokio runtime.
    pub fn new(config: &SourceConfig, retry: &SourceRetryConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| RelayError::Config(format!("sources need a tokio runtime: {}", e)))?;

        Ok(Self {
            url: config.url(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            request_timeout: retry.request_timeout(),
            retry: Mutex::new(make_retry_exponential_backoff(
                retry.initial_delay(),
                retry.max_delay(),
                handle.clone(),
            )),
            handle,
            state: RwLock::new(SourceState::default()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts `request` and decodes the upstream envelope.
    async fn post(&self, request: &UpstreamRequest, client_ip: Option<&str>) -> Result<UpstreamResponse> {
        let body = serde_json::to_vec(request)?;

        let mut builder = Request::builder()
            .method("POST")
            .uri(&self.url)
            .header("Content-Type", "application/json");
        if let Some(ip) = client_ip {
            builder = builder.header("X-Forwarded-For", ip);
        }
        let http_request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RelayError::Transport(format!("Failed to build request: {}", e)))?;

        let exchange = async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|e| RelayError::Transport(format!("HTTP request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(RelayError::Transport(format!("upstream returned {}", status)));
            }

            response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| RelayError::Transport(format!("Failed to read response: {}", e)))
        };

        let body_bytes = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| RelayError::Timeout(self.request_timeout.as_millis() as u64))??;

        let response: UpstreamResponse = serde_json::from_slice(&body_bytes)?;
        self.state.write().last_message = Some(Instant::now());
        Ok(response)
    }

    /// Calls `method` and returns its `result` object, failing on upstream
    /// errors.
    async fn call(&self, method: &str, params: Value) -> Result<JsonObject> {
        self.post(&UpstreamRequest::new(method, params), None)
            .await?
            .into_result()
    }

    async fn server_info(&self) -> Result<LedgerRanges> {
        let result = self.call("server_info", json!({})).await?;
        let complete_ledgers = result
            .get("info")
            .and_then(|info| info.get("complete_ledgers"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RelayError::InvalidResponse("server_info has no complete_ledgers".to_string())
            })?;

        LedgerRanges::parse(complete_ledgers)
    }

    fn probe_cycle(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            match self.server_info().await {
                Ok(ranges) => {
                    let was_connected = {
                        let mut state = self.state.write();
                        let was_connected = state.connected;
                        state.connected = true;
                        state.ranges = ranges;
                        was_connected
                    };
                    if !was_connected {
                        info!(source = %self.url, "Connected to source");
                    }
                    self.retry.lock().reset();
                }
                Err(e) => {
                    let was_connected = std::mem::replace(&mut self.state.write().connected, false);
                    if was_connected {
                        warn!(source = %self.url, "Lost connection to source: {}", e);
                    } else {
                        debug!(source = %self.url, "Source still unreachable: {}", e);
                    }
                }
            }

            self.schedule_probe();
        }
        .boxed()
    }

    fn schedule_probe(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // The timer must not keep the source alive: dropping the last owner
        // drops the Retry, which cancels the timer.
        let source = Arc::downgrade(self);
        self.retry.lock().schedule(move || match source.upgrade() {
            Some(source) => source.probe_cycle(),
            None => async {}.boxed(),
        });
    }

    /// Pages `ledger_data` from `start` until the cursor reaches `end`.
    async fn download_range(
        &self,
        sequence: u32,
        start: Option<String>,
        end: Option<String>,
    ) -> Result<Vec<String>> {
        let mut records = Vec::new();
        let mut marker = start;

        loop {
            let mut params = json!({
                "ledger_index": sequence,
                "binary": true,
                "limit": LEDGER_DATA_PAGE_LIMIT,
            });
            if let Some(marker) = &marker {
                params["marker"] = json!(marker);
            }

            let result = self.call("ledger_data", params).await?;
            let state = result
                .get("state")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for object in state {
                let before_end = match (&end, object.get("index").and_then(Value::as_str)) {
                    (Some(end), Some(index)) => index.to_ascii_uppercase() < *end,
                    _ => true,
                };
                if !before_end {
                    continue;
                }
                if let Some(data) = object.get("data").and_then(Value::as_str) {
                    records.push(data.to_string());
                }
            }

            match result.get("marker").and_then(Value::as_str) {
                Some(next)
                    if end
                        .as_deref()
                        .map_or(true, |end| next.to_ascii_uppercase().as_str() < end) =>
                {
                    marker = Some(next.to_string());
                }
                _ => break,
            }
        }

        Ok(records)
    }

    /// Posts a client request and returns the upstream `result` object as-is,
    /// upstream-reported errors included.
    async fn forward(&self, request: &JsonObject, client_ip: &str) -> Result<JsonObject> {
        if !self.is_connected() {
            return Err(RelayError::SourceDisconnected(self.url.clone()));
        }

        let upstream_request = UpstreamRequest::from_client_object(request)?;
        match self.post(&upstream_request, Some(client_ip)).await?.result {
            Value::Object(result) => Ok(result),
            other => Err(RelayError::InvalidResponse(format!(
                "forwarded request returned a non-object result: {}",
                other
            ))),
        }
    }
}

/// Splits the 256-bit key space into `count` cursors.
///
/// The first cursor starts at the beginning of the ledger and carries no
/// marker; the others start at evenly spaced 64-hex-digit keys.
pub fn key_space_markers(count: u32) -> Vec<Option<String>> {
    let count = count.clamp(1, 256);
    (0..count)
        .map(|i| (i > 0).then(|| format!("{:02X}{}", i * 256 / count, "0".repeat(62))))
        .collect()
}

#[async_trait]
impl Source for RpcSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    fn has_ledger(&self, sequence: u32) -> bool {
        self.state.read().ranges.contains(sequence)
    }

    async fn fetch_ledger(
        &self,
        sequence: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<LedgerResponse> {
        let params = json!({
            "ledger_index": sequence,
            "transactions": get_objects,
            "expand": get_objects,
            "binary": true,
            // Ignored by upstreams without neighbour support.
            "get_object_neighbors": get_objects && get_object_neighbors,
        });

        let payload = self.call("ledger", params).await?;
        if payload.get("validated").and_then(Value::as_bool) != Some(true) {
            return Err(RelayError::LedgerNotValidated(sequence));
        }

        Ok(LedgerResponse {
            sequence,
            validated: true,
            payload,
        })
    }

    async fn load_initial_ledger(
        &self,
        sequence: u32,
        num_markers: u32,
        cache_only: bool,
    ) -> Result<Vec<String>> {
        let markers = key_space_markers(num_markers);
        info!(
            sequence,
            source = %self.url,
            cursors = markers.len(),
            cache_only,
            "Starting initial ledger download"
        );

        let ends = markers.iter().skip(1).cloned().chain(std::iter::once(None));
        let downloads = markers
            .iter()
            .cloned()
            .zip(ends)
            .map(|(start, end)| self.download_range(sequence, start, end));

        let mut records = Vec::new();
        for range in future::join_all(downloads).await {
            records.extend(range?);
        }

        info!(sequence, source = %self.url, objects = records.len(), "Finished initial ledger download");
        Ok(records)
    }

    async fn forward_request(&self, request: &JsonObject, client_ip: &str) -> Option<JsonObject> {
        match self.forward(request, client_ip).await {
            Ok(result) => Some(result),
            Err(e @ (RelayError::SourceDisconnected(_) | RelayError::InvalidRequest(_))) => {
                debug!(source = %self.url, "Not forwarding request: {}", e);
                None
            }
            Err(e) => {
                warn!(source = %self.url, "Failed to forward request: {}", e);
                None
            }
        }
    }

    fn status(&self) -> SourceStatus {
        let state = self.state.read();
        SourceStatus {
            url: self.url.clone(),
            connected: state.connected,
            validated_ledgers: state.ranges.to_string(),
            latest_ledger: state.ranges.max_sequence(),
            last_message_age_secs: state.last_message.map(|at| at.elapsed().as_secs()),
            reconnect_attempts: self.retry.lock().attempt_number(),
        }
    }

    fn run(self: Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        let handle = self.handle.clone();
        handle.spawn(self.probe_cycle());
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.retry.lock().cancel();
        debug!(source = %self.url, "Stopped source");
    }
}

impl std::fmt::Debug for RpcSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSource")
            .field("url", &self.url)
            .field("state", &*self.state.read())
            .finish()
    }
}
