//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only needs the keys it changes.

mod retrieval;
mod storage;

pub use retrieval::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use strata_core::RetryPolicy;

/// Root settings type for the memory engine.
///
/// Constructed once at startup by [`load_settings`](crate::load_settings) and
/// handed to the services that need it.
///
/// ```json
/// {
///   "ingest": { "writeConcurrency": 4 },
///   "retrieval": { "scoring": { "correctionBonus": 1.5 } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrataSettings {
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: LogLevelSetting,
    /// Ingestion pipeline limits.
    pub ingest: IngestSettings,
    /// Rate-limit retry policy for provider and extraction calls.
    pub retry: RetryPolicy,
    /// Embedding cache sizing and persistence.
    pub cache: CacheSettings,
    /// Retrieval fusion and scoring.
    pub retrieval: RetrievalSettings,
    /// Context assembly budgets.
    pub context: ContextSettings,
    /// Conversation ledger and background persistence.
    pub conversation: ConversationSettings,
    /// Cross-layer linker tuning.
    pub linker: LinkerSettings,
    /// Embedding/chat provider endpoint.
    pub provider: ProviderSettings,
    /// Knowledge extraction service endpoint.
    pub extraction: ExtractionSettings,
    /// Graph store location and pool.
    pub store: StoreSettings,
}

/// Log level wrapper so the root can derive `Default`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevelSetting(pub String);

impl Default for LogLevelSetting {
    fn default() -> Self {
        Self("info".to_string())
    }
}
