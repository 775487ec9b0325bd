//! Embedding error types.
//!
//! Embedding failures are recoverable: the ingestion path records them as
//! warnings and search falls back to lexical ranking.

use thiserror::Error;

/// Errors from embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The upstream provider failed.
    #[error("embedding provider failed: {0}")]
    Provider(String),

    /// Cache snapshot could not be read or written.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache snapshot could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A vector had an unexpected length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensions.
        expected: usize,
        /// Received dimensions.
        actual: usize,
    },

    /// Nothing to embed, or the provider returned nothing.
    #[error("empty embedding input or result")]
    Empty,

    /// A blocking snapshot task failed to complete.
    #[error("cache task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;
