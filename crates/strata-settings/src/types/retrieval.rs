//! Retrieval, context assembly, conversation and linker settings.
//!
//! [`ScoringTable`] collects every heuristic constant the fusion engine
//! applies so they can be tuned without touching the algorithm.

use serde::{Deserialize, Serialize};

/// Score heuristics applied during retrieval fusion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringTable {
    /// Multiplier for ordinary conversational turns.
    pub chat_turn_multiplier: f64,
    /// Multiplier for conversation summaries.
    pub summary_multiplier: f64,
    /// Flat bonus for episodes carrying a correction marker.
    pub correction_bonus: f64,
    /// Score for an episode when the search returned no ranking.
    pub default_episode: f64,
    /// Score for an entity when the search returned no ranking.
    pub default_entity: f64,
    /// Score for a relationship when the search returned no ranking.
    pub default_relationship: f64,
    /// Score for a community when the search returned no ranking.
    pub default_community: f64,
    /// Score given to entities reached over one bridge.
    pub expanded_entity: f64,
    /// Score given to relationships of bridged entities.
    pub expanded_relationship: f64,
    /// Score given to entities reached over two bridges.
    pub second_hop: f64,
}

impl Default for ScoringTable {
    fn default() -> Self {
        Self {
            chat_turn_multiplier: 0.3,
            summary_multiplier: 1.3,
            correction_bonus: 2.0,
            default_episode: 0.6,
            default_entity: 0.7,
            default_relationship: 0.5,
            default_community: 0.4,
            expanded_entity: 0.5,
            expanded_relationship: 0.4,
            second_hop: 0.3,
        }
    }
}

/// Retrieval fusion settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalSettings {
    /// Heuristic score table.
    pub scoring: ScoringTable,
    /// Max bridged neighbors followed on the first hop.
    pub expansion_neighbor_limit: usize,
    /// Max relationships pulled in by expansion overall.
    pub expansion_edge_limit: usize,
    /// Follow bridges a second time from first-hop neighbors.
    pub second_hop_enabled: bool,
    /// Max entities added by the second hop.
    pub second_hop_limit: usize,
    /// Episodes with this many characters or fewer are dropped.
    pub min_episode_chars: usize,
    /// Episode text kept per result.
    pub max_episode_chars: usize,
    /// Keep expansion inside the requested layers.
    pub restrict_expansion_to_requested_layers: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            scoring: ScoringTable::default(),
            expansion_neighbor_limit: 20,
            expansion_edge_limit: 50,
            second_hop_enabled: false,
            second_hop_limit: 10,
            min_episode_chars: 20,
            max_episode_chars: 8000,
            restrict_expansion_to_requested_layers: false,
        }
    }
}

/// Context assembly budgets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Budget in estimated tokens (4 characters each).
    pub max_tokens: usize,
    /// Episodes included at most.
    pub max_episodes: usize,
    /// How deep into the ranked episodes to look for usable ones.
    pub episode_scan_depth: usize,
    /// Entities listed when no episode qualified.
    pub max_entities: usize,
    /// Relationships listed at most.
    pub max_relationships: usize,
    /// Communities listed at most.
    pub max_communities: usize,
    /// Snippet length for long episodes.
    pub snippet_max_len: usize,
    /// Characters kept before the first query hit.
    pub snippet_window: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            max_episodes: 3,
            episode_scan_depth: 30,
            max_entities: 5,
            max_relationships: 8,
            max_communities: 3,
            snippet_max_len: 520,
            snippet_window: 240,
        }
    }
}

/// Conversation ledger and background persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    /// A summary is written every this many turns.
    pub summary_interval: i64,
    /// Timeout for each background persistence job.
    pub persist_timeout_secs: u64,
    /// Messages kept per user in the in-process buffer.
    pub buffer_max_messages: usize,
    /// Pending background jobs before new ones are rejected.
    pub queue_capacity: usize,
    /// Background workers.
    pub queue_workers: usize,
    /// Buffers idle for longer than this are dropped.
    pub buffer_idle_hours: u64,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            summary_interval: 10,
            persist_timeout_secs: 30,
            buffer_max_messages: 12,
            queue_capacity: 64,
            queue_workers: 2,
            buffer_idle_hours: 24,
        }
    }
}

/// Cross-layer linker tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkerSettings {
    /// Cosine similarity above which backfill bridges differently-named entities.
    pub similarity_threshold: f32,
    /// Entities processed per backfill batch.
    pub batch_size: usize,
}

impl Default for LinkerSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.93,
            batch_size: 500,
        }
    }
}
