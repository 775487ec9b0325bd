//! [`GraphStore`] over a pooled `SQLite` database.
//!
//! Repositories are synchronous. Each trait method checks out a pooled
//! connection inside `spawn_blocking` so store I/O never stalls the runtime.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use strata_core::{
    ClaimId, Community, CommunityId, ConversationId, Entity, EntityId, Episode, EpisodeId, Fact, FactId,
    Layer, UserId,
};
use tracing::info;

use crate::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::errors::Result;
use crate::graph::GraphStore;
use crate::migrations::run_migrations;
use crate::repositories::author::AuthorRepo;
use crate::repositories::bridge::BridgeRepo;
use crate::repositories::claim::ClaimRepo;
use crate::repositories::community::CommunityRepo;
use crate::repositories::counter::CounterRepo;
use crate::repositories::entity::EntityRepo;
use crate::repositories::episode::EpisodeRepo;
use crate::repositories::fact::FactRepo;
use crate::repositories::search::SearchRepo;
use crate::types::{
    BridgedNeighbor, EntityPatch, MergeOutcome, NewCommunity, NewEntity, NewEpisode, NewFact,
    SearchHits, SearchRequest, TemporalFilter,
};

/// `SQLite`-backed graph store. Cheap to clone.
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: ConnectionPool,
}

impl SqliteGraphStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &Path, config: &ConnectionConfig) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        let store = Self::from_pool(pool)?;
        info!(path = %path.display(), "graph store opened");
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    /// Wrap an existing pool and run migrations on it.
    pub fn from_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Check out a connection for synchronous batch work.
    pub fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn find_episode_by_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
    ) -> Result<Option<Episode>> {
        let fingerprint = fingerprint.to_string();
        self.run(move |c| EpisodeRepo::find_by_fingerprint(c, layer, &fingerprint))
            .await
    }

    async fn find_episode_by_content(
        &self,
        layer: Layer,
        content: &str,
        source_description: &str,
    ) -> Result<Option<Episode>> {
        let content = content.to_string();
        let source = source_description.to_string();
        self.run(move |c| EpisodeRepo::find_by_content(c, layer, &content, &source))
            .await
    }

    async fn claim_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
        owner: &ClaimId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let (fingerprint, owner) = (fingerprint.to_string(), owner.clone());
        self.run(move |c| ClaimRepo::acquire(c, layer, &fingerprint, &owner, stale_before))
            .await
    }

    async fn release_fingerprint(
        &self,
        layer: Layer,
        fingerprint: &str,
        owner: &ClaimId,
    ) -> Result<bool> {
        let (fingerprint, owner) = (fingerprint.to_string(), owner.clone());
        self.run(move |c| ClaimRepo::release(c, layer, &fingerprint, &owner))
            .await
    }

    async fn get_episode(&self, id: &EpisodeId) -> Result<Option<Episode>> {
        let id = id.clone();
        self.run(move |c| EpisodeRepo::get(c, &id)).await
    }

    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode> {
        self.run(move |c| EpisodeRepo::insert(c, &episode)).await
    }

    async fn set_episode_embedding(&self, id: &EpisodeId, vector: Vec<f32>) -> Result<bool> {
        let id = id.clone();
        self.run(move |c| EpisodeRepo::set_embedding(c, &id, &vector))
            .await
    }

    async fn get_episode_embedding(&self, id: &EpisodeId) -> Result<Option<Vec<f32>>> {
        let id = id.clone();
        self.run(move |c| EpisodeRepo::get_embedding(c, &id)).await
    }

    async fn set_episode_layer_if_missing(&self, id: &EpisodeId, layer: Layer) -> Result<bool> {
        let id = id.clone();
        self.run(move |c| EpisodeRepo::set_layer_if_missing(c, &id, layer))
            .await
    }

    async fn set_episode_fingerprint(&self, id: &EpisodeId, fingerprint: &str) -> Result<bool> {
        let id = id.clone();
        let fingerprint = fingerprint.to_string();
        self.run(move |c| EpisodeRepo::set_fingerprint(c, &id, &fingerprint))
            .await
    }

    async fn update_episode_metadata(
        &self,
        id: &EpisodeId,
        patch: serde_json::Value,
    ) -> Result<()> {
        let id = id.clone();
        self.run(move |c| EpisodeRepo::update_metadata(c, &id, &patch))
            .await
    }

    async fn count_turn_episodes(
        &self,
        user: &UserId,
        conversation: &ConversationId,
    ) -> Result<u64> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.run(move |c| EpisodeRepo::count_turns(c, &user, &conversation))
            .await
    }

    async fn conversation_turns(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Episode>> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.run(move |c| EpisodeRepo::turns_in_range(c, &user, &conversation, from, to))
            .await
    }

    async fn upsert_entity(&self, entity: NewEntity) -> Result<Entity> {
        self.run(move |c| EntityRepo::upsert(c, &entity)).await
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let id = id.clone();
        self.run(move |c| EntityRepo::get(c, &id)).await
    }

    async fn mention(&self, episode: &EpisodeId, entity: &EntityId) -> Result<()> {
        let (episode, entity) = (episode.clone(), entity.clone());
        self.run(move |c| EntityRepo::mention(c, &episode, &entity))
            .await
    }

    async fn entities_mentioned_by(&self, episode: &EpisodeId) -> Result<Vec<Entity>> {
        let episode = episode.clone();
        self.run(move |c| EntityRepo::mentioned_by(c, &episode)).await
    }

    async fn set_entity_name_norm(&self, id: &EntityId, key: Option<String>) -> Result<()> {
        let id = id.clone();
        self.run(move |c| EntityRepo::set_name_norm(c, &id, key.as_deref()))
            .await
    }

    async fn entities_with_name_norm(&self, key: &str) -> Result<Vec<Entity>> {
        let key = key.to_string();
        self.run(move |c| EntityRepo::with_name_norm(c, &key)).await
    }

    async fn list_entities(&self, offset: usize, limit: usize) -> Result<Vec<Entity>> {
        self.run(move |c| EntityRepo::list(c, offset, limit)).await
    }

    async fn set_entity_embedding(&self, id: &EntityId, vector: Vec<f32>) -> Result<()> {
        let id = id.clone();
        self.run(move |c| EntityRepo::set_embedding(c, &id, &vector))
            .await
    }

    async fn entity_embeddings(&self, ids: &[EntityId]) -> Result<Vec<(EntityId, Vec<f32>)>> {
        let ids = ids.to_vec();
        self.run(move |c| EntityRepo::embeddings(c, &ids)).await
    }

    async fn merge_entities(
        &self,
        master: &EntityId,
        losers: &[EntityId],
        patch: EntityPatch,
    ) -> Result<MergeOutcome> {
        let (master, losers) = (master.clone(), losers.to_vec());
        self.run(move |c| EntityRepo::merge(c, &master, &losers, &patch))
            .await
    }

    async fn insert_fact(&self, fact: NewFact) -> Result<Fact> {
        self.run(move |c| FactRepo::insert(c, &fact)).await
    }

    async fn invalidate_fact(&self, id: &FactId, at: DateTime<Utc>) -> Result<bool> {
        let id = id.clone();
        self.run(move |c| FactRepo::invalidate(c, &id, at)).await
    }

    async fn outgoing_facts(
        &self,
        entity_ids: &[EntityId],
        temporal: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        let ids = entity_ids.to_vec();
        self.run(move |c| FactRepo::outgoing(c, &ids, temporal, limit))
            .await
    }

    async fn create_bridge(&self, a: &EntityId, b: &EntityId) -> Result<bool> {
        let (a, b) = (a.clone(), b.clone());
        self.run(move |c| BridgeRepo::create(c, &a, &b)).await
    }

    async fn bridged_neighbors(
        &self,
        entity_ids: &[EntityId],
        allowed_layers: &[Layer],
        limit: usize,
    ) -> Result<Vec<BridgedNeighbor>> {
        let ids = entity_ids.to_vec();
        let layers = allowed_layers.to_vec();
        self.run(move |c| BridgeRepo::neighbors(c, &ids, &layers, limit))
            .await
    }

    async fn count_bridges(&self) -> Result<u64> {
        self.run(BridgeRepo::count).await
    }

    async fn upsert_community(&self, community: NewCommunity) -> Result<Community> {
        self.run(move |c| CommunityRepo::upsert(c, &community)).await
    }

    async fn add_community_member(
        &self,
        community: &CommunityId,
        entity: &EntityId,
    ) -> Result<()> {
        let (community, entity) = (community.clone(), entity.clone());
        self.run(move |c| CommunityRepo::add_member(c, &community, &entity))
            .await
    }

    async fn increment_counter(
        &self,
        user: &UserId,
        conversation: &ConversationId,
    ) -> Result<i64> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.run(move |c| CounterRepo::increment(c, &user, &conversation))
            .await
    }

    async fn attach_author(&self, user: &UserId, episode: &EpisodeId) -> Result<()> {
        let (user, episode) = (user.clone(), episode.clone());
        self.run(move |c| AuthorRepo::attach(c, &user, &episode)).await
    }

    async fn hybrid_search(&self, request: SearchRequest) -> Result<SearchHits> {
        self.run(move |c| SearchRepo::hybrid(c, &request)).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
