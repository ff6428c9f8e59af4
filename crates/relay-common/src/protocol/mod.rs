pub mod error;
pub mod jsonrpc;

pub use error::{RelayError, Result};
pub use jsonrpc::{JsonObject, UpstreamError, UpstreamRequest, UpstreamResponse};
