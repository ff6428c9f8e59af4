//! Upstream source selection for ledger-relay
//!
//! A [`LoadBalancer`] owns a fixed pool of [`Source`]s and routes ledger
//! fetches, initial downloads and forwarded client requests across them,
//! failing over when a source is missing data or misbehaves.

pub mod load_balancer;
pub mod rpc_source;
pub mod source;

pub use load_balancer::{LoadBalancer, FULL_PASS_DELAY};
pub use rpc_source::RpcSource;
pub use source::{LedgerRanges, LedgerResponse, Source, SourceStatus};
