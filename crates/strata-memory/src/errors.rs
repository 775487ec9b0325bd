//! Memory engine errors.

use thiserror::Error;

/// Errors surfaced by the ingestion, retrieval and conversation services.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Graph store failure.
    #[error(transparent)]
    Store(#[from] strata_store::StoreError),

    /// Embedding failure.
    #[error(transparent)]
    Embedding(#[from] strata_embeddings::EmbeddingError),

    /// Provider or extraction service failure.
    #[error(transparent)]
    Provider(#[from] strata_llm::ProviderError),

    /// Nothing to ingest.
    #[error("text is empty")]
    EmptyText,

    /// The extraction service answered without an episode id and recovery
    /// found nothing.
    #[error("no episode id in extraction response for '{source_description}'")]
    NoEpisodeId {
        /// Source description of the failed write.
        source_description: String,
    },

    /// A bounded operation ran out of time.
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// What was running.
        operation: String,
        /// Budget in seconds.
        secs: u64,
    },

    /// The background queue has shut down.
    #[error("background queue closed")]
    QueueClosed,
}

/// Result alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
