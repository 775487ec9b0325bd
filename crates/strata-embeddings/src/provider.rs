//! Embedding provider trait, a deterministic hash embedder, and the
//! cache-through wrapper used by the engine.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use strata_core::text::fingerprint;
use strata_core::vector::{l2_normalize, mean_vector};
use tracing::debug;

use crate::cache::EmbeddingCache;
use crate::errors::{EmbeddingError, Result};

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed one text.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::Empty)
    }

    /// Model identifier, part of every cache key.
    fn model(&self) -> &str;
}

/// Cache key for `text` under `model`: the content fingerprint plus model.
pub fn cache_key(text: &str, model: &str) -> String {
    format!("{}|{model}", fingerprint(text))
}

/// Deterministic offline embedder.
///
/// Hashes each text with SHA-256 and spreads the digest over the vector,
/// then L2-normalizes. Identical texts map to identical vectors; it carries
/// no semantics. Used by tests and when no provider is configured.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// Embedder producing `dims`-length vectors.
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let hash = Sha256::digest(text.as_bytes());
        let mut v: Vec<f32> = (0..self.dims)
            .map(|i| (f32::from(hash[i % hash.len()]) / 127.5) - 1.0)
            .collect();
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_to_vector(t)).collect())
    }

    fn model(&self) -> &str {
        "hash"
    }
}

/// Cache-through embedder: cached vectors are served from the
/// [`EmbeddingCache`], misses go to the provider in one batch.
#[derive(Clone)]
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
}

impl CachedEmbedder {
    /// Wrap `provider` with `cache`.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self { provider, cache }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Mean of the embeddings of `texts`.
    pub async fn embed_average(&self, texts: &[String]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        let vectors = self.embed(texts).await?;
        let expected = vectors.first().map_or(0, Vec::len);
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }
        mean_vector(&vectors).ok_or(EmbeddingError::Empty)
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.provider.model().to_string();
        let keys: Vec<String> = texts.iter().map(|t| cache_key(t, &model)).collect();

        let mut out: Vec<Option<Vec<f32>>> = keys.iter().map(|k| self.cache.get(k)).collect();
        let missing: Vec<usize> = out
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_none().then_some(i))
            .collect();

        if !missing.is_empty() {
            debug!(
                hits = texts.len() - missing.len(),
                misses = missing.len(),
                "embedding batch"
            );
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.provider.embed(&batch).await?;
            if fresh.len() != batch.len() {
                return Err(EmbeddingError::Provider(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    fresh.len()
                )));
            }
            for (idx, vector) in missing.into_iter().zip(fresh) {
                if vector.is_empty() {
                    return Err(EmbeddingError::Empty);
                }
                self.cache.insert(keys[idx].clone(), vector.clone()).await;
                out[idx] = Some(vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or(EmbeddingError::Empty))
            .collect()
    }

    fn model(&self) -> &str {
        self.provider.model()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
