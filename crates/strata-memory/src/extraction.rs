//! The knowledge extraction seam and its response adapter.
//!
//! Extraction services answer in several shapes: the episode id may be a
//! top-level `uuid`, nested under `episode`, or keyed `episode_id`/`id`,
//! and extracted entities/edges may be partially filled.
//! [`ExtractionOutcome::from_response`] is the only place that knows this.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::EpisodeId;
use strata_llm::{ExtractionRequest, HttpExtractionClient};
use tracing::warn;

/// Persists an episode and whatever it can extract from it.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Write one episode; returns the service's raw response.
    async fn add_episode(&self, request: &ExtractionRequest) -> strata_llm::Result<Value>;
}

#[async_trait]
impl ExtractionService for HttpExtractionClient {
    async fn add_episode(&self, request: &ExtractionRequest) -> strata_llm::Result<Value> {
        HttpExtractionClient::add_episode(self, request).await
    }
}

/// A well-formed extracted entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    /// Service-side id.
    pub uuid: String,
    /// Display name.
    pub name: String,
    /// Summary, possibly empty.
    pub summary: String,
}

/// A well-formed extracted relationship.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    /// Source entity id.
    pub source: String,
    /// Target entity id.
    pub target: String,
    /// Relationship label.
    pub relation: String,
    /// Fact text, possibly empty.
    pub fact: String,
}

/// Normalized extraction response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractionOutcome {
    episode_id: Option<EpisodeId>,
    /// Entities that passed validation.
    pub entities: Vec<ExtractedEntity>,
    /// Relationships that passed validation.
    pub relationships: Vec<ExtractedRelationship>,
    /// Entities dropped for missing id or name.
    pub dropped_entities: usize,
    /// Relationships dropped for missing endpoints or label.
    pub dropped_relationships: usize,
}

fn non_empty_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn array<'a>(value: &'a Value, keys: &[&str]) -> &'a [Value] {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

impl ExtractionOutcome {
    /// Normalize a raw response.
    pub fn from_response(value: &Value) -> Self {
        let episode_id = match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => non_empty_str(value, &["uuid", "episode_id", "id"]).or_else(|| {
                value
                    .get("episode")
                    .and_then(|ep| non_empty_str(ep, &["uuid", "id"]))
            }),
        }
        .map(EpisodeId::from);

        let raw_entities = array(value, &["nodes", "extracted_entities", "entities"]);
        let entities: Vec<ExtractedEntity> = raw_entities
            .iter()
            .filter_map(|e| {
                Some(ExtractedEntity {
                    uuid: non_empty_str(e, &["uuid", "id"])?.to_string(),
                    name: non_empty_str(e, &["name"])?.to_string(),
                    summary: non_empty_str(e, &["summary"]).unwrap_or_default().to_string(),
                })
            })
            .collect();

        let raw_edges = array(value, &["edges", "extracted_edges", "relationships"]);
        let relationships: Vec<ExtractedRelationship> = raw_edges
            .iter()
            .filter_map(|e| {
                Some(ExtractedRelationship {
                    source: non_empty_str(e, &["source_node_uuid", "source"])?.to_string(),
                    target: non_empty_str(e, &["target_node_uuid", "target"])?.to_string(),
                    relation: non_empty_str(e, &["relationship_type", "name", "relation"])?
                        .to_string(),
                    fact: non_empty_str(e, &["fact"]).unwrap_or_default().to_string(),
                })
            })
            .collect();

        let outcome = Self {
            episode_id,
            dropped_entities: raw_entities.len() - entities.len(),
            dropped_relationships: raw_edges.len() - relationships.len(),
            entities,
            relationships,
        };
        if outcome.has_dropped() {
            warn!(
                entities = outcome.dropped_entities,
                relationships = outcome.dropped_relationships,
                "dropped malformed extraction results"
            );
        }
        outcome
    }

    /// Outcome for an episode found by other means (validation recovery).
    pub fn recovered(id: EpisodeId) -> Self {
        Self {
            episode_id: Some(id),
            ..Self::default()
        }
    }

    /// The written episode, if the response named it.
    pub fn episode_id(&self) -> Option<&EpisodeId> {
        self.episode_id.as_ref()
    }

    /// Whether anything was dropped.
    pub fn has_dropped(&self) -> bool {
        self.dropped_entities > 0 || self.dropped_relationships > 0
    }

    /// Warning line for dropped results in chunk `index`.
    pub fn dropped_warning(&self, index: usize) -> Option<String> {
        self.has_dropped().then(|| {
            format!(
                "chunk {index}: dropped {} entities and {} relationships",
                self.dropped_entities, self.dropped_relationships
            )
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
