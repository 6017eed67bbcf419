//! Error types for handle construction.

use thiserror::Error;

/// Errors raised synchronously while building a handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A `:param` segment was left without a value.
    #[error("required parameter {param} from {path} has not been provided")]
    MissingParam { param: String, path: String },

    /// A collection path was given where a document path is required.
    #[error("expected document path but got: {0}")]
    ExpectedDocument(String),

    /// A document path was given where a collection path is required.
    #[error("expected collection path but got: {0}")]
    ExpectedCollection(String),

    /// Empty path or empty path segment.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// A constraint could not be turned into a query.
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
}
