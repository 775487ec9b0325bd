//! The graph store contract the memory engine is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::{
    ClaimId, Community, CommunityId, ConversationId, Entity, EntityId, Episode, EpisodeId, Fact, FactId,
    Layer, UserId,
};

use crate::errors::Result;
use crate::types::{
    BridgedNeighbor, EntityPatch, MergeOutcome, NewCommunity, NewEntity, NewEpisode, NewFact,
    SearchHits, SearchRequest, TemporalFilter,
};

/// Persistent graph of episodes, entities, relationships and bridges.
///
/// The store is the single source of truth; implementations hold no
/// per-request state. Every method may suspend.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ── Episodes ────────────────────────────────────────────────────────

    /// Oldest episode in `layer` carrying `fingerprint`.
    async fn find_episode_by_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
    ) -> Result<Option<Episode>>;

    /// Most recent episode with this exact content and source description.
    async fn find_episode_by_content(
        &self,
        layer: Layer,
        content: &str,
        source_description: &str,
    ) -> Result<Option<Episode>>;

    /// Episode by id.
    async fn get_episode(&self, id: &EpisodeId) -> Result<Option<Episode>>;

    /// Persist a new episode.
    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode>;

    /// Store or replace the episode's embedding.
    async fn set_episode_embedding(&self, id: &EpisodeId, vector: Vec<f32>) -> Result<bool>;

    /// Stored embedding of an episode.
    async fn get_episode_embedding(&self, id: &EpisodeId) -> Result<Option<Vec<f32>>>;

    /// Stamp the layer unless one is set. Returns whether it was stamped.
    async fn set_episode_layer_if_missing(&self, id: &EpisodeId, layer: Layer) -> Result<bool>;

    /// Overwrite the episode fingerprint.
    async fn set_episode_fingerprint(&self, id: &EpisodeId, fingerprint: &str) -> Result<bool>;

    /// Merge a JSON object into the episode metadata.
    async fn update_episode_metadata(&self, id: &EpisodeId, patch: serde_json::Value)
    -> Result<()>;

    /// Claim `(layer, fingerprint)` for `owner` before writing it. Returns
    /// `false` while a claim newer than `stale_before` is held elsewhere.
    async fn claim_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
        owner: &ClaimId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop `owner`'s claim on `(layer, fingerprint)`.
    async fn release_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
        owner: &ClaimId,
    ) -> Result<bool>;

    /// Number of stored turns of a conversation.
    async fn count_turn_episodes(
        &self,
        user: &UserId,
        conversation: &ConversationId,
    ) -> Result<u64>;

    /// Stored turns with `from <= turn_index <= to`, in turn order.
    async fn conversation_turns(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Episode>>;

    // ── Entities ────────────────────────────────────────────────────────

    /// Insert or update the live entity with the same `(layer, name)`.
    async fn upsert_entity(&self, entity: NewEntity) -> Result<Entity>;

    /// Entity by id, merged-away ones included.
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    /// Record that an episode mentions an entity.
    async fn mention(&self, episode: &EpisodeId, entity: &EntityId) -> Result<()>;

    /// Live entities mentioned by an episode.
    async fn entities_mentioned_by(&self, episode: &EpisodeId) -> Result<Vec<Entity>>;

    /// Store (or clear) the canonical linking key.
    async fn set_entity_name_norm(&self, id: &EntityId, key: Option<String>) -> Result<()>;

    /// Live entities with the given canonical key.
    async fn entities_with_name_norm(&self, key: &str) -> Result<Vec<Entity>>;

    /// Page through live entities in id order.
    async fn list_entities(&self, offset: usize, limit: usize) -> Result<Vec<Entity>>;

    /// Store an entity embedding.
    async fn set_entity_embedding(&self, id: &EntityId, vector: Vec<f32>) -> Result<()>;

    /// Embeddings of the given entities that have one.
    async fn entity_embeddings(&self, ids: &[EntityId]) -> Result<Vec<(EntityId, Vec<f32>)>>;

    /// Fold `losers` into `master`.
    async fn merge_entities(
        &self,
        master: &EntityId,
        losers: &[EntityId],
        patch: EntityPatch,
    ) -> Result<MergeOutcome>;

    // ── Facts ───────────────────────────────────────────────────────────

    /// Persist a relationship.
    async fn insert_fact(&self, fact: NewFact) -> Result<Fact>;

    /// End a relationship's validity at `at`.
    async fn invalidate_fact(&self, id: &FactId, at: DateTime<Utc>) -> Result<bool>;

    /// Relationships whose subject is one of `entity_ids`.
    async fn outgoing_facts(
        &self,
        entity_ids: &[EntityId],
        temporal: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<Fact>>;

    // ── Bridges ─────────────────────────────────────────────────────────

    /// Create the bridge `{a, b}`. Returns `true` only when newly created.
    async fn create_bridge(&self, a: &EntityId, b: &EntityId) -> Result<bool>;

    /// Entities across a bridge from `entity_ids`, in a different layer.
    async fn bridged_neighbors(
        &self,
        entity_ids: &[EntityId],
        allowed_layers: &[Layer],
        limit: usize,
    ) -> Result<Vec<BridgedNeighbor>>;

    /// Total number of bridges.
    async fn count_bridges(&self) -> Result<u64>;

    // ── Communities ─────────────────────────────────────────────────────

    /// Insert or refresh a community.
    async fn upsert_community(&self, community: NewCommunity) -> Result<Community>;

    /// Add an entity to a community.
    async fn add_community_member(&self, community: &CommunityId, entity: &EntityId)
    -> Result<()>;

    // ── Counters and authorship ─────────────────────────────────────────

    /// Atomically create-or-increment the turn counter and return it.
    async fn increment_counter(&self, user: &UserId, conversation: &ConversationId)
    -> Result<i64>;

    /// Link an author to an episode. Idempotent.
    async fn attach_author(&self, user: &UserId, episode: &EpisodeId) -> Result<()>;

    // ── Search ──────────────────────────────────────────────────────────

    /// Hybrid lexical + vector search.
    async fn hybrid_search(&self, request: SearchRequest) -> Result<SearchHits>;
}
