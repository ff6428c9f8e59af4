//! RpcSource and LoadBalancer Integration Tests
//!
//! Runs real HTTP exchanges against mock upstream ledger nodes served by axum.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use parking_lot::Mutex;
use relay_balancer::{LoadBalancer, RpcSource, Source};
use relay_common::config::{RelayConfig, SourceConfig, SourceRetryConfig};
use relay_common::protocol::error::RelayError;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock Upstream Node
// ============================================================================

/// Objects served per `ledger_data` page, small enough to force paging.
const PAGE_SIZE: usize = 3;

struct MockState {
    healthy: AtomicBool,
    validated: AtomicBool,
    complete_ledgers: Mutex<String>,
    /// (index, data) pairs sorted by index
    objects: Vec<(String, String)>,
    forwarded_for: Mutex<Vec<String>>,
    ledger_data_calls: AtomicUsize,
}

struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    async fn start(complete_ledgers: &str) -> Self {
        // 32 objects spread evenly across the key space
        let objects = (0..32u32)
            .map(|i| (format!("{:02X}{}", i * 8, "1".repeat(62)), format!("DATA{:02}", i)))
            .collect();

        let state = Arc::new(MockState {
            healthy: AtomicBool::new(true),
            validated: AtomicBool::new(true),
            complete_ledgers: Mutex::new(complete_ledgers.to_string()),
            objects,
            forwarded_for: Mutex::new(Vec::new()),
            ledger_data_calls: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", post(handle_rpc))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    fn source_config(&self) -> SourceConfig {
        SourceConfig {
            ip: self.addr.ip().to_string(),
            rpc_port: self.addr.port(),
        }
    }
}

async fn handle_rpc(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.healthy.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "unhealthy").into_response();
    }

    let method = body["method"].as_str().unwrap_or_default().to_string();
    let params = body["params"][0].clone();

    let result = match method.as_str() {
        "server_info" => json!({
            "status": "success",
            "info": { "complete_ledgers": state.complete_ledgers.lock().clone() },
        }),
        "ledger" => json!({
            "status": "success",
            "ledger_index": params["ledger_index"],
            "validated": state.validated.load(Ordering::SeqCst),
            "ledger": { "ledger_data": "ABCDEF" },
        }),
        "ledger_data" => {
            state.ledger_data_calls.fetch_add(1, Ordering::SeqCst);
            let start = params["marker"].as_str().unwrap_or_default();
            let page: Vec<&(String, String)> = state
                .objects
                .iter()
                .filter(|(index, _)| index.as_str() >= start)
                .take(PAGE_SIZE + 1)
                .collect();

            let mut result = json!({
                "status": "success",
                "ledger_index": params["ledger_index"],
                "state": page
                    .iter()
                    .take(PAGE_SIZE)
                    .map(|(index, data)| json!({"index": index, "data": data}))
                    .collect::<Vec<_>>(),
            });
            if let Some((next, _)) = page.get(PAGE_SIZE) {
                result["marker"] = json!(next);
            }
            result
        }
        "bad_request" => json!({
            "status": "error",
            "error": "invalidParams",
            "error_code": 31,
        }),
        _ => {
            if let Some(ip) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                state.forwarded_for.lock().push(ip.to_string());
            }
            json!({ "status": "success", "method": method, "params": params })
        }
    };

    Json(json!({ "result": result })).into_response()
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_retry() -> SourceRetryConfig {
    SourceRetryConfig {
        initial_delay_ms: 20,
        max_delay_ms: 100,
        request_timeout_ms: 2000,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

async fn connected_source(upstream: &MockUpstream) -> Arc<RpcSource> {
    let source = Arc::new(RpcSource::new(&upstream.source_config(), &fast_retry()).unwrap());
    Arc::clone(&source).run();
    wait_until(|| source.is_connected()).await;
    source
}

/// A port nothing listens on.
async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// RpcSource
// ============================================================================

#[tokio::test]
async fn test_source_connects_and_advertises_ledgers() {
    let upstream = MockUpstream::start("100-200,250").await;
    let source = connected_source(&upstream).await;

    assert!(source.has_ledger(100));
    assert!(source.has_ledger(150));
    assert!(source.has_ledger(250));
    assert!(!source.has_ledger(201));

    let status = source.status();
    assert!(status.connected);
    assert_eq!(status.validated_ledgers, "100-200,250");
    assert_eq!(status.latest_ledger, Some(250));
    assert!(status.last_message_age_secs.is_some());

    source.stop();
}

#[tokio::test]
async fn test_source_follows_advertised_ranges() {
    let upstream = MockUpstream::start("100-200").await;
    let source = connected_source(&upstream).await;
    assert!(!source.has_ledger(300));

    *upstream.state.complete_ledgers.lock() = "100-300".to_string();
    wait_until(|| source.has_ledger(300)).await;

    source.stop();
}

#[tokio::test]
async fn test_source_reconnects_after_outage() {
    let upstream = MockUpstream::start("1-10").await;
    let source = connected_source(&upstream).await;

    upstream.state.healthy.store(false, Ordering::SeqCst);
    wait_until(|| !source.is_connected()).await;
    wait_until(|| source.status().reconnect_attempts > 0).await;

    upstream.state.healthy.store(true, Ordering::SeqCst);
    wait_until(|| source.is_connected()).await;

    source.stop();
}

#[tokio::test]
async fn test_source_never_connects_to_dead_upstream() {
    let config = SourceConfig {
        ip: "127.0.0.1".to_string(),
        rpc_port: dead_port().await,
    };
    let source = Arc::new(RpcSource::new(&config, &fast_retry()).unwrap());
    Arc::clone(&source).run();

    wait_until(|| source.status().reconnect_attempts >= 2).await;
    assert!(!source.is_connected());
    assert!(!source.has_ledger(1));

    source.stop();
}

#[tokio::test]
async fn test_fetch_validated_ledger() {
    let upstream = MockUpstream::start("1-1000").await;
    let source = connected_source(&upstream).await;

    let response = source.fetch_ledger(500, true, true).await.unwrap();
    assert_eq!(response.sequence, 500);
    assert!(response.validated);
    assert_eq!(response.payload["ledger_index"], 500);
    assert_eq!(response.payload["ledger"]["ledger_data"], "ABCDEF");

    source.stop();
}

#[tokio::test]
async fn test_fetch_unvalidated_ledger_is_an_error() {
    let upstream = MockUpstream::start("1-1000").await;
    upstream.state.validated.store(false, Ordering::SeqCst);
    let source = connected_source(&upstream).await;

    let result = source.fetch_ledger(500, false, false).await;
    assert!(matches!(result, Err(RelayError::LedgerNotValidated(500))));

    source.stop();
}

#[tokio::test]
async fn test_load_initial_ledger_covers_key_space_once() {
    let upstream = MockUpstream::start("1-1000").await;
    let source = connected_source(&upstream).await;

    for num_markers in [1, 4, 16] {
        let mut records = source.load_initial_ledger(10, num_markers, false).await.unwrap();
        records.sort();

        let expected: Vec<String> = (0..32).map(|i| format!("DATA{:02}", i)).collect();
        assert_eq!(records, expected, "num_markers = {}", num_markers);
    }

    source.stop();
}

#[tokio::test]
async fn test_load_initial_ledger_pages_concurrently() {
    let upstream = MockUpstream::start("1-1000").await;
    let source = connected_source(&upstream).await;

    source.load_initial_ledger(10, 4, true).await.unwrap();
    // 8 objects per cursor at 3 per page
    assert_eq!(upstream.state.ledger_data_calls.load(Ordering::SeqCst), 12);

    source.stop();
}

#[tokio::test]
async fn test_forward_sets_client_ip() {
    let upstream = MockUpstream::start("1-10").await;
    let source = connected_source(&upstream).await;

    let request = json!({"command": "account_info", "account": "rTest"});
    let reply = source
        .forward_request(request.as_object().unwrap(), "203.0.113.7")
        .await
        .unwrap();

    assert_eq!(reply["status"], "success");
    assert_eq!(reply["method"], "account_info");
    assert_eq!(reply["params"]["account"], "rTest");
    assert_eq!(
        upstream.state.forwarded_for.lock().as_slice(),
        ["203.0.113.7".to_string()]
    );

    source.stop();
}

#[tokio::test]
async fn test_forward_passes_upstream_errors_through() {
    let upstream = MockUpstream::start("1-10").await;
    let source = connected_source(&upstream).await;

    let request = json!({"method": "bad_request"});
    let reply = source
        .forward_request(request.as_object().unwrap(), "203.0.113.7")
        .await
        .unwrap();
    assert_eq!(reply["error"], "invalidParams");

    source.stop();
}

// ============================================================================
// LoadBalancer over real sources
// ============================================================================

#[tokio::test]
async fn test_balancer_routes_to_source_with_ledger() {
    let old = MockUpstream::start("1-50").await;
    let recent = MockUpstream::start("100-200").await;
    let dead = dead_port().await;

    let config = RelayConfig::from_json(&format!(
        r#"{{
            "etl_sources": [
                {{"ip": "127.0.0.1", "rpc_port": {}}},
                {{"ip": "127.0.0.1", "rpc_port": {}}},
                {{"ip": "127.0.0.1", "rpc_port": {}}}
            ],
            "num_markers": 2,
            "source_retry": {{"initial_delay_ms": 20, "max_delay_ms": 100}}
        }}"#,
        old.addr.port(),
        recent.addr.port(),
        dead
    ))
    .unwrap();

    let balancer = LoadBalancer::from_config(&config, false).unwrap();
    assert_eq!(balancer.source_count(), 3);
    assert_eq!(balancer.download_ranges(), 2);

    wait_until(|| balancer.snapshot().iter().filter(|s| s.connected).count() == 2).await;

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        balancer.fetch_ledger(150, false, false),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.payload["ledger_index"], 150);

    let records = tokio::time::timeout(
        Duration::from_secs(5),
        balancer.load_initial_ledger(20, false),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(records.len(), 32);

    let snapshot = balancer.snapshot();
    assert_eq!(snapshot[0].validated_ledgers, "1-50");
    assert_eq!(snapshot[1].validated_ledgers, "100-200");
    assert_eq!(snapshot[1].latest_ledger, Some(200));
    assert!(!snapshot[2].connected);

    balancer.stop();
}

#[tokio::test]
async fn test_balancer_forwards_through_connected_source() {
    let upstream = MockUpstream::start("1-10").await;
    let dead = dead_port().await;

    let config = RelayConfig::from_json(&format!(
        r#"{{
            "etl_sources": [
                {{"ip": "127.0.0.1", "rpc_port": {}}},
                {{"ip": "127.0.0.1", "rpc_port": {}}}
            ],
            "source_retry": {{"initial_delay_ms": 20, "max_delay_ms": 100}}
        }}"#,
        dead,
        upstream.addr.port()
    ))
    .unwrap();

    let balancer = LoadBalancer::from_config(&config, true).unwrap();
    assert_eq!(balancer.download_ranges(), 4);
    wait_until(|| balancer.snapshot()[1].connected).await;

    let request = json!({"command": "fee"});
    for _ in 0..5 {
        let reply = balancer
            .forward_request(request.as_object().unwrap(), "198.51.100.1")
            .await
            .unwrap();
        assert_eq!(reply["method"], "fee");
    }
    assert_eq!(upstream.state.forwarded_for.lock().len(), 5);

    balancer.stop();
}
