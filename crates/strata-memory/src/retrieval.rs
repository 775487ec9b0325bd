//! # Retrieval Fusion Engine
//!
//! Hybrid store search plus the heuristics layered on top of it: layer
//! filtering, score adjustment by episode kind, and cross-layer expansion
//! over bridges.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::text::{is_correction_text, truncate_chars};
use strata_core::{Community, Entity, EntityId, Episode, EpisodeKind, Fact, Layer};
use strata_embeddings::EmbeddingProvider;
use strata_settings::{RetrievalSettings, ScoringTable};
use strata_store::{GraphStore, SearchHits, SearchRequest, TemporalFilter};
use tracing::{debug, warn};

use crate::errors::Result;

/// Source description that marks a conversational episode.
const CHAT_SOURCE: &str = "chat";

/// A search call.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchQuery {
    /// Query text.
    pub text: String,
    /// Layers to search; empty means all.
    pub layers: Vec<Layer>,
    /// Per-collection result cap.
    pub limit: usize,
    /// Point in time for relationship validity; current facts when `None`.
    pub as_of: Option<DateTime<Utc>>,
}

impl SearchQuery {
    /// Search all layers for current facts.
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            layers: Vec::new(),
            limit,
            as_of: None,
        }
    }

    /// Restrict to `layers`.
    #[must_use]
    pub fn layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.layers = layers.into_iter().collect();
        self
    }

    /// See relationships as they were at `at`.
    #[must_use]
    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    /// The relationship validity predicate for this query.
    pub fn temporal(&self) -> TemporalFilter {
        self.as_of.map_or(TemporalFilter::Current, TemporalFilter::AsOf)
    }
}

/// How the layer restriction is applied.
///
/// The store's multi-layer predicate is not trusted: with more than one
/// layer requested the search runs unfiltered and hits are filtered here.
/// Dropping [`LayerFilterStrategy::Local`] in favor of
/// [`LayerFilterStrategy::Store`] for every case is a one-line change in
/// [`LayerFilterStrategy::for_layers`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerFilterStrategy {
    /// No restriction.
    All,
    /// The store filters on a single layer.
    Store(Layer),
    /// Unfiltered search, filtered in this engine.
    Local(Vec<Layer>),
}

impl LayerFilterStrategy {
    /// Pick the strategy for a requested layer set.
    pub fn for_layers(layers: &[Layer]) -> Self {
        let mut unique: Vec<Layer> = Vec::with_capacity(layers.len());
        for layer in layers {
            if !unique.contains(layer) {
                unique.push(*layer);
            }
        }
        match unique.as_slice() {
            [] => Self::All,
            [single] => Self::Store(*single),
            _ => Self::Local(unique),
        }
    }

    /// Layer filter to push down to the store.
    pub fn store_layers(&self) -> Vec<Layer> {
        match self {
            Self::Store(layer) => vec![*layer],
            Self::All | Self::Local(_) => Vec::new(),
        }
    }

    /// Whether an item in `layer` passes.
    pub fn admits(&self, layer: Option<Layer>) -> bool {
        match self {
            Self::All => true,
            Self::Store(wanted) => layer == Some(*wanted),
            Self::Local(wanted) => layer.is_some_and(|l| wanted.contains(&l)),
        }
    }

    /// Store fetch size for a requested limit. Local filtering discards
    /// hits, so it over-fetches by the number of layers.
    pub fn fetch_limit(&self, limit: usize) -> usize {
        match self {
            Self::Local(layers) => limit.saturating_mul(layers.len()),
            Self::All | Self::Store(_) => limit,
        }
    }
}

/// A result item with its score and provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scored<T> {
    /// The item.
    pub item: T,
    /// Relevance after adjustment.
    pub score: f64,
    /// Reached through a bridge rather than matched directly.
    pub expanded: bool,
    /// Bridge hops from a direct hit; 0 for direct hits.
    pub hop: u8,
}

impl<T> Scored<T> {
    fn direct(item: T, score: f64) -> Self {
        Self {
            item,
            score,
            expanded: false,
            hop: 0,
        }
    }

    fn expanded(item: T, score: f64, hop: u8) -> Self {
        Self {
            item,
            score,
            expanded: true,
            hop,
        }
    }
}

/// Fused search results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionResult {
    /// Episodes, best first.
    pub episodes: Vec<Scored<Episode>>,
    /// Entities: direct hits best first, then expanded ones.
    pub entities: Vec<Scored<Entity>>,
    /// Relationships: direct hits best first, then expanded ones.
    pub relationships: Vec<Scored<Fact>>,
    /// Communities, best first.
    pub communities: Vec<Scored<Community>>,
}

impl FusionResult {
    /// Whether every collection is empty.
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
            && self.entities.is_empty()
            && self.relationships.is_empty()
            && self.communities.is_empty()
    }
}

/// Episode score after kind and correction adjustments.
pub fn adjust_episode_score(base: f64, episode: &Episode, table: &ScoringTable) -> f64 {
    let mut score = base;
    match episode.kind {
        Some(EpisodeKind::ChatSummary) => score *= table.summary_multiplier,
        Some(EpisodeKind::ChatTurn) => score *= table.chat_turn_multiplier,
        _ if episode.source_description == CHAT_SOURCE => score *= table.chat_turn_multiplier,
        _ => {}
    }
    if episode.is_correction || is_correction_text(&episode.content) {
        score += table.correction_bonus;
    }
    score
}

fn score_at(scores: &[f64], i: usize, default: f64) -> f64 {
    scores.get(i).copied().filter(|s| s.is_finite()).unwrap_or(default)
}

fn by_score_desc<T>(a: &Scored<T>, b: &Scored<T>) -> std::cmp::Ordering {
    b.score.total_cmp(&a.score)
}

/// The read path.
#[derive(Clone)]
pub struct RetrievalFusion {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: RetrievalSettings,
}

impl RetrievalFusion {
    /// Engine over `store`, embedding queries with `embedder`.
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    /// Search, score and expand.
    pub async fn search(&self, query: &SearchQuery) -> Result<FusionResult> {
        let started = Instant::now();
        if query.text.trim().is_empty() || query.limit == 0 {
            return Ok(FusionResult::default());
        }

        let strategy = LayerFilterStrategy::for_layers(&query.layers);
        let temporal = query.temporal();
        let query_vector = match self.embedder.embed_single(query.text.trim()).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, searching lexically");
                None
            }
        };

        let hits = self
            .store
            .hybrid_search(SearchRequest {
                query: query.text.clone(),
                query_vector,
                layers: strategy.store_layers(),
                temporal,
                limit: strategy.fetch_limit(query.limit),
            })
            .await?;

        let mut result = self.score_hits(hits, &strategy, query.limit);
        if !result.entities.is_empty() {
            self.expand(&mut result, query, temporal).await;
        }

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("search_duration_seconds").record(elapsed);
        debug!(
            query = %query.text,
            ?strategy,
            episodes = result.episodes.len(),
            entities = result.entities.len(),
            relationships = result.relationships.len(),
            communities = result.communities.len(),
            elapsed,
            "search finished"
        );
        Ok(result)
    }

    fn score_hits(&self, hits: SearchHits, strategy: &LayerFilterStrategy, limit: usize) -> FusionResult {
        let table = &self.settings.scoring;
        let SearchHits {
            episodes,
            episode_scores,
            entities,
            entity_scores,
            facts,
            fact_scores,
            communities,
            community_scores,
        } = hits;

        let mut out = FusionResult::default();

        for (i, mut episode) in episodes.into_iter().enumerate() {
            if !strategy.admits(episode.layer) {
                continue;
            }
            if episode.content.trim().chars().count() <= self.settings.min_episode_chars {
                continue;
            }
            if !episode.is_correction && is_correction_text(&episode.content) {
                episode.is_correction = true;
            }
            let base = score_at(&episode_scores, i, table.default_episode);
            let score = adjust_episode_score(base, &episode, table);
            let cut = truncate_chars(&episode.content, self.settings.max_episode_chars).len();
            episode.content.truncate(cut);
            out.episodes.push(Scored::direct(episode, score));
        }

        for (i, entity) in entities.into_iter().enumerate() {
            if strategy.admits(Some(entity.layer)) {
                let score = score_at(&entity_scores, i, table.default_entity);
                out.entities.push(Scored::direct(entity, score));
            }
        }

        for (i, fact) in facts.into_iter().enumerate() {
            if strategy.admits(Some(fact.layer)) {
                let score = score_at(&fact_scores, i, table.default_relationship);
                out.relationships.push(Scored::direct(fact, score));
            }
        }

        for (i, community) in communities.into_iter().enumerate() {
            if strategy.admits(Some(community.layer)) {
                let score = score_at(&community_scores, i, table.default_community);
                out.communities.push(Scored::direct(community, score));
            }
        }

        out.episodes.sort_by(by_score_desc);
        out.entities.sort_by(by_score_desc);
        out.relationships.sort_by(by_score_desc);
        out.communities.sort_by(by_score_desc);
        out.episodes.truncate(limit);
        out.entities.truncate(limit);
        out.relationships.truncate(limit);
        out.communities.truncate(limit);
        out
    }

    /// Follow bridges out of the direct entity hits. Store failures here
    /// degrade to fewer results.
    async fn expand(&self, result: &mut FusionResult, query: &SearchQuery, temporal: TemporalFilter) {
        let allowed = if self.settings.restrict_expansion_to_requested_layers {
            query.layers.clone()
        } else {
            Vec::new()
        };
        let mut seen_entities: HashSet<EntityId> =
            result.entities.iter().map(|e| e.item.id.clone()).collect();
        let mut seen_facts: HashSet<_> =
            result.relationships.iter().map(|f| f.item.id.clone()).collect();
        let seeds: Vec<EntityId> = seen_entities.iter().cloned().collect();

        let table = &self.settings.scoring;
        let first = self
            .hop(
                result,
                &seeds,
                &allowed,
                temporal,
                HopPlan {
                    hop: 1,
                    neighbor_limit: self.settings.expansion_neighbor_limit,
                    edge_limit: self.settings.expansion_edge_limit,
                    entity_score: table.expanded_entity,
                    fact_score: table.expanded_relationship,
                },
                &mut seen_entities,
                &mut seen_facts,
            )
            .await;

        if self.settings.second_hop_enabled && !first.is_empty() {
            let _ = self
                .hop(
                    result,
                    &first,
                    &allowed,
                    temporal,
                    HopPlan {
                        hop: 2,
                        neighbor_limit: self.settings.second_hop_limit,
                        edge_limit: self.settings.second_hop_limit,
                        entity_score: table.second_hop,
                        fact_score: table.second_hop,
                    },
                    &mut seen_entities,
                    &mut seen_facts,
                )
                .await;
        }
    }

    /// One bridge hop from `from`. Returns the newly reached entity ids.
    #[allow(clippy::too_many_arguments)]
    async fn hop(
        &self,
        result: &mut FusionResult,
        from: &[EntityId],
        allowed: &[Layer],
        temporal: TemporalFilter,
        plan: HopPlan,
        seen_entities: &mut HashSet<EntityId>,
        seen_facts: &mut HashSet<strata_core::FactId>,
    ) -> Vec<EntityId> {
        let neighbors = match self
            .store
            .bridged_neighbors(from, allowed, plan.neighbor_limit)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(hop = plan.hop, error = %e, "bridge expansion failed");
                return Vec::new();
            }
        };

        let mut reached = Vec::new();
        for neighbor in neighbors {
            if seen_entities.insert(neighbor.entity.id.clone()) {
                reached.push(neighbor.entity.id.clone());
                result
                    .entities
                    .push(Scored::expanded(neighbor.entity, plan.entity_score, plan.hop));
            }
        }
        if reached.is_empty() {
            return reached;
        }

        match self
            .store
            .outgoing_facts(&reached, temporal, plan.edge_limit)
            .await
        {
            Ok(facts) => {
                for fact in facts {
                    if seen_facts.insert(fact.id.clone()) {
                        result
                            .relationships
                            .push(Scored::expanded(fact, plan.fact_score, plan.hop));
                    }
                }
            }
            Err(e) => warn!(hop = plan.hop, error = %e, "relationship expansion failed"),
        }
        debug!(hop = plan.hop, reached = reached.len(), "bridge expansion");
        reached
    }
}

#[derive(Clone, Copy)]
struct HopPlan {
    hop: u8,
    neighbor_limit: usize,
    edge_limit: usize,
    entity_score: f64,
    fact_score: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_embeddings::HashEmbedder;
    use strata_store::{NewEntity, NewEpisode, NewFact, SqliteGraphStore};

    fn episode(kind: Option<EpisodeKind>, source: &str, content: &str) -> Episode {
        Episode {
            id: "e1".into(),
            name: "n".into(),
            content: content.into(),
            layer: Some(Layer::Personal),
            fingerprint: None,
            kind,
            source_description: source.into(),
            author: None,
            conversation_id: None,
            turn_index: None,
            is_correction: false,
            summarized: false,
            metadata: json!({}),
            created_at: Utc::now(),
            valid_at: Utc::now(),
        }
    }

    #[test]
    fn strategy_by_layer_count() {
        assert_eq!(LayerFilterStrategy::for_layers(&[]), LayerFilterStrategy::All);
        assert_eq!(
            LayerFilterStrategy::for_layers(&[Layer::Personal, Layer::Personal]),
            LayerFilterStrategy::Store(Layer::Personal)
        );
        let local = LayerFilterStrategy::for_layers(&[Layer::Personal, Layer::Project]);
        assert!(local.store_layers().is_empty());
        assert!(local.admits(Some(Layer::Project)));
        assert!(!local.admits(Some(Layer::Knowledge)));
        assert!(!local.admits(None));
        assert_eq!(local.fetch_limit(10), 20);
    }

    #[test]
    fn episode_score_adjustments() {
        let t = ScoringTable::default();
        let plain = episode(Some(EpisodeKind::Document), "doc", "Lena is a designer");
        assert!((adjust_episode_score(1.0, &plain, &t) - 1.0).abs() < 1e-9);

        let turn = episode(Some(EpisodeKind::ChatTurn), "chat", "User: hi\nAssistant: hello");
        assert!((adjust_episode_score(1.0, &turn, &t) - 0.3).abs() < 1e-9);

        let untagged_chat = episode(None, "chat", "User: hi\nAssistant: hello");
        assert!((adjust_episode_score(1.0, &untagged_chat, &t) - 0.3).abs() < 1e-9);

        let summary = episode(Some(EpisodeKind::ChatSummary), "chat", "They discussed design");
        assert!((adjust_episode_score(1.0, &summary, &t) - 1.3).abs() < 1e-9);

        let correction = episode(
            Some(EpisodeKind::ChatTurn),
            "chat",
            "User: actually she works at Figma now",
        );
        assert!((adjust_episode_score(1.0, &correction, &t) - 2.3).abs() < 1e-9);
    }

    struct Fixture {
        store: Arc<SqliteGraphStore>,
        knowledge_lena: EntityId,
        personal_lena: EntityId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let k = store
            .upsert_entity(NewEntity {
                name: "Lena".into(),
                layer: Layer::Knowledge,
                summary: "Designer".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let design = store
            .upsert_entity(NewEntity {
                name: "Design".into(),
                layer: Layer::Knowledge,
                summary: String::new(),
                tags: vec![],
            })
            .await
            .unwrap();
        let p = store
            .upsert_entity(NewEntity {
                name: "Lena".into(),
                layer: Layer::Personal,
                summary: "My friend".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let _ = store
            .insert_fact(NewFact {
                layer: Layer::Knowledge,
                source: k.id.clone(),
                target: design.id.clone(),
                relation: "works_as".into(),
                fact: "Lena is a designer".into(),
                valid_at: None,
                episode: None,
            })
            .await
            .unwrap();
        assert!(store.create_bridge(&k.id, &p.id).await.unwrap());

        let mut ep = NewEpisode::new("note", "Lena mentioned her weekend plans with the family.");
        ep.layer = Some(Layer::Personal);
        ep.source_description = "chat".into();
        ep.kind = Some(EpisodeKind::ChatTurn);
        let _ = store.insert_episode(ep).await.unwrap();
        let mut short = NewEpisode::new("short", "Lena ok");
        short.layer = Some(Layer::Personal);
        let _ = store.insert_episode(short).await.unwrap();

        Fixture {
            store,
            knowledge_lena: k.id,
            personal_lena: p.id,
        }
    }

    fn engine(store: Arc<SqliteGraphStore>, settings: RetrievalSettings) -> RetrievalFusion {
        RetrievalFusion::new(store, Arc::new(HashEmbedder::new(8)), settings)
    }

    #[tokio::test]
    async fn personal_search_expands_into_knowledge() {
        let fx = fixture().await;
        let fusion = engine(fx.store.clone(), RetrievalSettings::default());
        let result = fusion
            .search(&SearchQuery::new("Lena", 10).layers([Layer::Personal]))
            .await
            .unwrap();

        let direct = &result.entities[0];
        assert_eq!(direct.item.id, fx.personal_lena);
        assert!(!direct.expanded);

        let expanded = result
            .entities
            .iter()
            .find(|e| e.item.id == fx.knowledge_lena)
            .unwrap();
        assert!(expanded.expanded);
        assert_eq!(expanded.hop, 1);
        assert!((expanded.score - 0.5).abs() < 1e-9);

        let fact = result
            .relationships
            .iter()
            .find(|f| f.item.fact == "Lena is a designer")
            .unwrap();
        assert!(fact.expanded);
        assert_eq!(fact.hop, 1);
        assert!((fact.score - 0.4).abs() < 1e-9);

        // Short episodes are dropped; the chat turn is down-weighted.
        assert_eq!(result.episodes.len(), 1);
        assert_eq!(result.episodes[0].item.kind, Some(EpisodeKind::ChatTurn));
    }

    #[tokio::test]
    async fn direct_relationships_outrank_expanded_ones() {
        let fx = fixture().await;
        let running = fx
            .store
            .upsert_entity(NewEntity {
                name: "Running".into(),
                layer: Layer::Personal,
                summary: String::new(),
                tags: vec![],
            })
            .await
            .unwrap();
        let _ = fx
            .store
            .insert_fact(NewFact {
                layer: Layer::Personal,
                source: fx.personal_lena.clone(),
                target: running.id,
                relation: "is_a".into(),
                fact: "Lena is a runner".into(),
                valid_at: None,
                episode: None,
            })
            .await
            .unwrap();

        let result = engine(fx.store.clone(), RetrievalSettings::default())
            .search(&SearchQuery::new("Lena", 10).layers([Layer::Personal]))
            .await
            .unwrap();
        let direct = result
            .relationships
            .iter()
            .find(|f| f.item.fact == "Lena is a runner")
            .unwrap();
        let expanded = result
            .relationships
            .iter()
            .find(|f| f.item.fact == "Lena is a designer")
            .unwrap();
        assert!(!direct.expanded);
        assert!(expanded.expanded);
        assert!(direct.score > expanded.score, "{} <= {}", direct.score, expanded.score);
    }

    #[tokio::test]
    async fn correction_text_sets_the_flag() {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let mut ep = NewEpisode::new("note", "Correction: Lena moved to Tallinn last spring.");
        ep.layer = Some(Layer::Personal);
        let _ = store.insert_episode(ep).await.unwrap();

        let result = engine(store, RetrievalSettings::default())
            .search(&SearchQuery::new("Lena Tallinn", 10).layers([Layer::Personal]))
            .await
            .unwrap();
        let hit = &result.episodes[0];
        assert!(hit.item.is_correction);
        assert!(hit.score >= 2.0);
    }

    #[tokio::test]
    async fn restricted_expansion_stays_in_requested_layers() {
        let fx = fixture().await;
        let settings = RetrievalSettings {
            restrict_expansion_to_requested_layers: true,
            ..RetrievalSettings::default()
        };
        let result = engine(fx.store.clone(), settings)
            .search(&SearchQuery::new("Lena", 10).layers([Layer::Personal]))
            .await
            .unwrap();
        assert!(result.entities.iter().all(|e| !e.expanded));
        assert!(result.relationships.is_empty());
    }

    #[tokio::test]
    async fn multi_layer_search_filters_locally() {
        let fx = fixture().await;
        let result = engine(fx.store.clone(), RetrievalSettings::default())
            .search(&SearchQuery::new("Lena", 10).layers([Layer::Personal, Layer::Knowledge]))
            .await
            .unwrap();
        let direct: Vec<_> = result.entities.iter().filter(|e| !e.expanded).collect();
        assert_eq!(direct.len(), 2);
        // Both ends were direct hits, so nothing new is reached.
        assert!(result.entities.iter().all(|e| !e.expanded));

        let project_only = engine(fx.store.clone(), RetrievalSettings::default())
            .search(&SearchQuery::new("Lena", 10).layers([Layer::Project, Layer::Experience]))
            .await
            .unwrap();
        assert!(project_only.is_empty());
    }

    #[tokio::test]
    async fn as_of_hides_facts_not_yet_valid() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::days(400);
        let future_fact = fx
            .store
            .insert_fact(NewFact {
                layer: Layer::Personal,
                source: fx.personal_lena.clone(),
                target: fx.knowledge_lena.clone(),
                relation: "knows".into(),
                fact: "Lena knows about the knowledge base".into(),
                valid_at: Some(Utc::now()),
                episode: None,
            })
            .await
            .unwrap();
        let now = engine(fx.store.clone(), RetrievalSettings::default())
            .search(&SearchQuery::new("Lena knowledge", 10).layers([Layer::Personal]))
            .await
            .unwrap();
        assert!(now.relationships.iter().any(|f| f.item.id == future_fact.id));

        let then = engine(fx.store.clone(), RetrievalSettings::default())
            .search(
                &SearchQuery::new("Lena knowledge", 10)
                    .layers([Layer::Personal])
                    .as_of(past),
            )
            .await
            .unwrap();
        assert!(then.relationships.iter().all(|f| f.item.id != future_fact.id));
    }

    #[tokio::test]
    async fn blank_query_returns_nothing() {
        let fx = fixture().await;
        let result = engine(fx.store, RetrievalSettings::default())
            .search(&SearchQuery::new("   ", 10))
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
