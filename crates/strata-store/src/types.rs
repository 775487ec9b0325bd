//! Write-side inputs and search shapes for the graph store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{
    Community, ConversationId, Entity, EntityId, Episode, EpisodeId, EpisodeKind, Fact, Layer,
};

/// A new episode to persist.
#[derive(Clone, Debug)]
pub struct NewEpisode {
    /// Explicit id; generated when `None`.
    pub id: Option<EpisodeId>,
    /// Short name.
    pub name: String,
    /// Full text.
    pub content: String,
    /// Layer tag, when the writer knows it.
    pub layer: Option<Layer>,
    /// Content fingerprint.
    pub fingerprint: Option<String>,
    /// Kind tag.
    pub kind: Option<EpisodeKind>,
    /// Where the text came from.
    pub source_description: String,
    /// Conversation the episode belongs to.
    pub conversation_id: Option<ConversationId>,
    /// Allocated turn number.
    pub turn_index: Option<i64>,
    /// Whether the text carries a correction marker.
    pub is_correction: bool,
    /// Extra metadata (JSON object).
    pub metadata: serde_json::Value,
    /// Reference time.
    pub valid_at: DateTime<Utc>,
}

impl NewEpisode {
    /// Minimal episode with the given name and content, valid now.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            content: content.into(),
            layer: None,
            fingerprint: None,
            kind: None,
            source_description: String::new(),
            conversation_id: None,
            turn_index: None,
            is_correction: false,
            metadata: serde_json::json!({}),
            valid_at: Utc::now(),
        }
    }
}

/// A new or existing entity, matched by `(layer, name)`.
#[derive(Clone, Debug)]
pub struct NewEntity {
    /// Display name.
    pub name: String,
    /// Owning layer.
    pub layer: Layer,
    /// Summary; replaces an empty stored summary on upsert.
    pub summary: String,
    /// Tags; unioned into stored tags on upsert.
    pub tags: Vec<String>,
}

/// A new directed relationship.
#[derive(Clone, Debug)]
pub struct NewFact {
    /// Owning layer.
    pub layer: Layer,
    /// Subject.
    pub source: EntityId,
    /// Object.
    pub target: EntityId,
    /// Relationship label.
    pub relation: String,
    /// Free text.
    pub fact: String,
    /// Start of validity.
    pub valid_at: Option<DateTime<Utc>>,
    /// Episode the fact was extracted from.
    pub episode: Option<EpisodeId>,
}

/// A new or existing community, matched by `(layer, name)`.
#[derive(Clone, Debug)]
pub struct NewCommunity {
    /// Owning layer.
    pub layer: Layer,
    /// Community name.
    pub name: String,
    /// Summary text.
    pub summary: String,
}

/// Fields written onto the surviving entity of a merge.
#[derive(Clone, Debug, Default)]
pub struct EntityPatch {
    /// Replacement summary.
    pub summary: String,
    /// Replacement tags.
    pub tags: Vec<String>,
}

/// Result of merging duplicate entities into one survivor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Relationships re-pointed at the survivor.
    pub relationships_transferred: usize,
    /// Losers flagged as merged away.
    pub entities_merged: usize,
}

/// Which relationships a query may see.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TemporalFilter {
    /// Only relationships that were never invalidated.
    #[default]
    Current,
    /// Relationships valid at the given instant.
    AsOf(DateTime<Utc>),
}

/// Hybrid search parameters.
#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    /// Lexical query text.
    pub query: String,
    /// Query embedding for the vector leg; lexical only when `None`.
    pub query_vector: Option<Vec<f32>>,
    /// Layer filter; empty means all layers.
    pub layers: Vec<Layer>,
    /// Relationship validity predicate.
    pub temporal: TemporalFilter,
    /// Per-collection result cap.
    pub limit: usize,
}

/// Hybrid search results.
///
/// Each collection comes with a parallel score vector. A store that cannot
/// rank leaves the score vector empty and the caller substitutes defaults.
#[derive(Clone, Debug, Default)]
pub struct SearchHits {
    /// Matching episodes.
    pub episodes: Vec<Episode>,
    /// Scores parallel to `episodes`.
    pub episode_scores: Vec<f64>,
    /// Matching live entities.
    pub entities: Vec<Entity>,
    /// Scores parallel to `entities`.
    pub entity_scores: Vec<f64>,
    /// Matching relationships passing the temporal filter.
    pub facts: Vec<Fact>,
    /// Scores parallel to `facts`.
    pub fact_scores: Vec<f64>,
    /// Matching communities.
    pub communities: Vec<Community>,
    /// Scores parallel to `communities`.
    pub community_scores: Vec<f64>,
}

impl SearchHits {
    /// Whether every collection is empty.
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
            && self.entities.is_empty()
            && self.facts.is_empty()
            && self.communities.is_empty()
    }
}

/// An entity reached through a bridge.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgedNeighbor {
    /// Entity the bridge was followed from.
    pub from: EntityId,
    /// Entity on the other side.
    pub entity: Entity,
}
