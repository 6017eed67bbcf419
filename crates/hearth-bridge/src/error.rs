//! Bridge error types.

use std::io;

use hearth_cache::StoreError;
use hearth_core::BuildError;
use thiserror::Error;

/// Errors raised while serving or talking to a worker.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message was well-formed JSON but not a valid request or event.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("worker disconnected")]
    Disconnected,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BridgeError> for StoreError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Store(e) => e,
            BridgeError::Build(e) => StoreError::InvalidArgument(e.to_string()),
            BridgeError::Protocol(message) => StoreError::InvalidArgument(message),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
