//! Error taxonomy shared by the bridge crates.

use std::time::Duration;
use thiserror::Error;

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the connection bridge.
///
/// Per-message failures (`Validation`, `NotFound`, `DuplicateClient`) never
/// terminate a connection; `Transport` does. `Timeout` and `ConnectionClosed`
/// are what a caller waiting on a correlation table observes.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("client {0} is already registered")]
    DuplicateClient(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("outbound queue full for client {0}")]
    QueueFull(String),

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("server command failed: {0}")]
    CommandFailed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the sled-backed entity stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Envelope decoding failures for inbound client messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {kind} payload: {reason}")]
    Rejected { kind: &'static str, reason: String },
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        BridgeError::Validation(err.to_string())
    }
}
