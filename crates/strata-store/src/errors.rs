//! Error types for the graph store.
//!
//! [`StoreError`] is returned by every store operation. Callers in the
//! engine propagate it; only best-effort paths log and drop it.

use thiserror::Error;

/// Errors that can occur during graph store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind, e.g. `episode`.
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Invalid operation on the store.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A blocking store task failed to complete.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
