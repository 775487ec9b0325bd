//! # strata-embeddings
//!
//! Text embeddings for the Strata memory engine.
//!
//! - [`EmbeddingCache`]: bounded LRU + TTL cache with a JSON snapshot
//! - [`EmbeddingProvider`]: the provider seam (HTTP clients live in `strata-llm`)
//! - [`CachedEmbedder`]: cache-through batching and multi-text averaging
//! - [`HashEmbedder`]: deterministic offline vectors for tests and dry runs

#![deny(unsafe_code)]

pub mod cache;
pub mod errors;
pub mod provider;

pub use cache::{CacheConfig, CacheStats, EmbeddingCache};
pub use errors::{EmbeddingError, Result};
pub use provider::{CachedEmbedder, EmbeddingProvider, HashEmbedder, cache_key};
