use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No upstream sources configured")]
    NoSources,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Ledger {0} is not validated by the upstream")]
    LedgerNotValidated(u32),

    #[error("Source disconnected: {0}")]
    SourceDisconnected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
