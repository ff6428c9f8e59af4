//! Upstream JSON-RPC Envelope
//!
//! Upstream ledger nodes speak a JSON-RPC dialect that predates JSON-RPC 2.0:
//!
//! - Request format: `{"method": "...", "params": [{...}]}`
//! - Response format: `{"result": {..., "status": "success" | "error"}}`
//! - Errors are reported inside `result` as `error`, `error_code` and
//!   `error_message` fields rather than a top-level `error` object.
//!
//! # Example
//!
//! ```
//! use relay_common::protocol::jsonrpc::{UpstreamRequest, UpstreamResponse};
//! use serde_json::json;
//!
//! let request = UpstreamRequest::new("ledger", json!({"ledger_index": 100}));
//! assert_eq!(request.method, "ledger");
//!
//! let response: UpstreamResponse =
//!     serde_json::from_value(json!({"result": {"status": "success", "validated": true}})).unwrap();
//! assert!(response.into_result().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{RelayError, Result};

/// A JSON object as exchanged with clients and upstream nodes.
pub type JsonObject = Map<String, Value>;

/// Request sent to an upstream node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRequest {
    /// Name of the upstream method (e.g. `server_info`, `ledger`)
    pub method: String,
    /// Single-element parameter array, as upstream nodes expect
    pub params: Vec<Value>,
}

impl UpstreamRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params: vec![params],
        }
    }

    /// Builds an upstream request from a client-supplied object.
    ///
    /// Clients may name the method either `method` or `command`. Every other
    /// field is passed through as the parameter object.
    pub fn from_client_object(request: &JsonObject) -> Result<Self> {
        let method = request
            .get("method")
            .or_else(|| request.get("command"))
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::InvalidRequest("request has no method".to_string()))?
            .to_string();

        let params: JsonObject = request
            .iter()
            .filter(|(k, _)| k.as_str() != "method" && k.as_str() != "command")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self::new(method, Value::Object(params)))
    }
}

/// Error reported by an upstream node inside its `result` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// Short token, e.g. `lgrNotFound`
    pub error: String,
    /// Numeric code, when the upstream supplies one
    pub code: Option<i64>,
    /// Human-readable description
    pub message: Option<String>,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(msg)) => write!(f, "{} ({}): {}", self.error, code, msg),
            (None, Some(msg)) => write!(f, "{}: {}", self.error, msg),
            (Some(code), None) => write!(f, "{} ({})", self.error, code),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

/// Response returned by an upstream node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub result: Value,
}

impl UpstreamResponse {
    /// Returns the upstream-reported error, if any.
    pub fn error(&self) -> Option<UpstreamError> {
        let result = self.result.as_object()?;
        let is_error = result.get("status").and_then(Value::as_str) == Some("error")
            || result.contains_key("error");
        if !is_error {
            return None;
        }

        Some(UpstreamError {
            error: result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            code: result.get("error_code").and_then(Value::as_i64),
            message: result
                .get("error_message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Unwraps the `result` object, turning an upstream-reported error into
    /// [`RelayError::InvalidResponse`].
    pub fn into_result(self) -> Result<JsonObject> {
        if let Some(err) = self.error() {
            return Err(RelayError::InvalidResponse(err.to_string()));
        }

        match self.result {
            Value::Object(obj) => Ok(obj),
            other => Err(RelayError::InvalidResponse(format!(
                "expected result object, got {}",
                other
            ))),
        }
    }
}
