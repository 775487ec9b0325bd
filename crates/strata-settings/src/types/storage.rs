//! Write-path, cache, provider and store settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root directory for Strata state (`~/.strata`).
pub fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".strata")
}

/// Ingestion pipeline limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestSettings {
    /// Target upper bound for a chunk, in characters.
    pub max_chunk_chars: usize,
    /// Chunks smaller than this fold into their predecessor.
    pub min_chunk_chars: usize,
    /// Text budget handed to the embedding provider.
    pub max_embedding_chars: usize,
    /// Process-wide cap on concurrent episode writes.
    pub write_concurrency: usize,
    /// Chat messages longer than this are stored as documents, not turns.
    pub long_message_chars: usize,
    /// How long a duplicate ingest waits for the writer holding its claim.
    pub claim_wait_ms: u64,
    /// Poll interval while waiting on a claim.
    pub claim_poll_ms: u64,
    /// Claims older than this are considered abandoned and can be taken over.
    pub claim_stale_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1500,
            min_chunk_chars: 200,
            max_embedding_chars: 12_000,
            write_concurrency: 2,
            long_message_chars: 8000,
            claim_wait_ms: 30_000,
            claim_poll_ms: 100,
            claim_stale_secs: 600,
        }
    }
}

/// Embedding cache sizing and persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Maximum number of cached vectors.
    pub max_entries: usize,
    /// Entry lifetime in hours.
    pub ttl_hours: u64,
    /// Flush to disk after this many inserts.
    pub flush_every: usize,
    /// Snapshot file. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_hours: 168,
            flush_every: 10,
            path: Some(data_dir().join("embedding_cache.json")),
        }
    }
}

/// OpenAI-compatible embedding and chat endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// API base URL.
    pub base_url: String,
    /// API key. Only read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Embedding model name.
    pub embedding_model: String,
    /// Chat model used for summaries.
    pub chat_model: String,
    /// Request timeout.
    pub timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// Knowledge extraction service endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionSettings {
    /// Service base URL.
    pub base_url: String,
    /// Request timeout.
    pub timeout_ms: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_ms: 120_000,
        }
    }
}

/// Graph store location and connection pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `SQLite` database file.
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// `SQLite` busy timeout.
    pub busy_timeout_ms: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: data_dir().join("memory.db"),
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}
