//! Error types for the live cache.

use hearth_core::{BuildError, CacheKey};
use thiserror::Error;

/// Failure reported by an upstream listener.
///
/// Cloned to every subscriber attached to the failing entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("listener unavailable: {0}")]
    Unavailable(String),

    #[error("listener failed: {0}")]
    Failed(String),
}

/// Failure of a one-shot read or a write against the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to consumers of the cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The handle could not be built.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The shared listener for `key` failed; every subscriber receives this.
    #[error("listener for {key} failed: {source}")]
    Listen {
        key: CacheKey,
        #[source]
        source: ListenError,
    },

    /// This subscriber fell more than the channel capacity behind the shared
    /// listener for `key`. Its stream ends here; observing the key again
    /// resumes from the latest value.
    #[error("subscriber for {key} fell behind by {skipped} values")]
    Lagged { key: CacheKey, skipped: u64 },

    /// The stream for `key` ended before producing a value.
    #[error("stream for {key} closed before emitting")]
    Closed { key: CacheKey },

    #[error(transparent)]
    Store(#[from] StoreError),
}
