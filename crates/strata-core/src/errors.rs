//! Core error types.

use thiserror::Error;

/// Errors raised while parsing or validating core vocabulary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A layer name outside the fixed set.
    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    /// An episode kind tag outside the known set.
    #[error("unknown episode kind: {0}")]
    UnknownKind(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
