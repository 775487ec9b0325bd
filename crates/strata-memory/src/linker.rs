//! # Cross-Layer Linker
//!
//! Bridges entities whose canonical names match but live in different
//! layers, so retrieval can hop from "Lena" in `personal` to "Lena" in
//! `knowledge`.
//!
//! Per-episode linking runs after every successful ingest and is
//! best-effort. The batch tools (`backfill_bridges`, `dedupe_entities`) walk
//! the whole entity population and are meant for operators.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_core::vector::cosine_similarity;
use strata_core::{Entity, EntityId, EpisodeId, Layer};
use strata_settings::LinkerSettings;
use strata_store::{EntityPatch, GraphStore};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::normalizer::normalize_entity_name;

/// Outcome of linking one episode's entities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    /// Entities with a usable canonical key.
    pub candidates: usize,
    /// New bridges.
    pub bridges_created: usize,
}

/// Outcome of a bridge backfill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillStats {
    /// Entities visited.
    pub scanned: usize,
    /// Entities that received a key.
    pub normalized: usize,
    /// Entities left unkeyed (too short or a stop word).
    pub skipped: usize,
    /// Bridges created by key match.
    pub bridges_created: usize,
    /// Bridges created by embedding similarity.
    pub similarity_bridges: usize,
}

/// Outcome of entity deduplication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupeStats {
    /// Entities visited.
    pub total_entities: usize,
    /// Distinct `(layer, key)` groups.
    pub unique_groups: usize,
    /// Entities that duplicate a group master.
    pub duplicates_found: usize,
    /// Entities actually merged away (zero on a dry run).
    pub entities_merged: usize,
    /// Relationships re-pointed to masters.
    pub relationships_transferred: usize,
}

/// Normalizes entity names and maintains bridges.
#[derive(Clone)]
pub struct CrossLayerLinker {
    store: Arc<dyn GraphStore>,
    settings: LinkerSettings,
}

impl CrossLayerLinker {
    /// Linker over `store`.
    pub fn new(store: Arc<dyn GraphStore>, settings: LinkerSettings) -> Self {
        Self { store, settings }
    }

    /// Link the entities mentioned by `episode`, logging instead of failing.
    pub async fn link_episode(&self, episode: &EpisodeId) -> LinkStats {
        match self.try_link_episode(episode).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(episode = %episode, error = %e, "cross-layer linking failed");
                metrics::counter!("linker_failures_total").increment(1);
                LinkStats::default()
            }
        }
    }

    /// Link the entities mentioned by `episode`.
    ///
    /// Stores each entity's canonical key, then bridges it to every live
    /// entity with the same key in another layer. Bridge creation is
    /// insert-or-ignore on an ordered pair, so reruns and concurrent
    /// linkers never produce a second bridge.
    pub async fn try_link_episode(&self, episode: &EpisodeId) -> Result<LinkStats> {
        let mut stats = LinkStats::default();
        for entity in self.store.entities_mentioned_by(episode).await? {
            let Some(key) = normalize_entity_name(&entity.name) else {
                continue;
            };
            stats.candidates += 1;
            self.store
                .set_entity_name_norm(&entity.id, Some(key.clone()))
                .await?;
            stats.bridges_created += self.bridge_same_key(&entity, &key).await?;
        }
        if stats.bridges_created > 0 {
            info!(
                episode = %episode,
                candidates = stats.candidates,
                bridges_created = stats.bridges_created,
                "cross-layer links created"
            );
        } else {
            debug!(episode = %episode, candidates = stats.candidates, "no new cross-layer links");
        }
        Ok(stats)
    }

    async fn bridge_same_key(&self, entity: &Entity, key: &str) -> Result<usize> {
        let mut created = 0;
        for other in self.store.entities_with_name_norm(key).await? {
            if other.id == entity.id || other.layer == entity.layer {
                continue;
            }
            if self.store.create_bridge(&entity.id, &other.id).await? {
                metrics::counter!("bridges_created_total").increment(1);
                created += 1;
            }
        }
        Ok(created)
    }

    async fn all_entities(&self, batch_size: usize) -> Result<Vec<Entity>> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.store.list_entities(offset, batch_size).await?;
            let n = page.len();
            out.extend(page);
            if n < batch_size {
                return Ok(out);
            }
            offset += n;
        }
    }

    /// Normalize every live entity and bridge matching keys across layers.
    ///
    /// With `use_embeddings`, entities whose keys differ are also bridged
    /// when their stored embeddings reach the configured similarity.
    pub async fn backfill_bridges(
        &self,
        batch_size: usize,
        use_embeddings: bool,
    ) -> Result<BackfillStats> {
        let entities = self.all_entities(batch_size).await?;
        let mut stats = BackfillStats {
            scanned: entities.len(),
            ..BackfillStats::default()
        };

        let mut by_key: BTreeMap<String, Vec<(EntityId, Layer)>> = BTreeMap::new();
        for entity in &entities {
            let key = normalize_entity_name(&entity.name);
            if key != entity.name_norm {
                self.store
                    .set_entity_name_norm(&entity.id, key.clone())
                    .await?;
            }
            match key {
                Some(key) => {
                    stats.normalized += 1;
                    by_key
                        .entry(key)
                        .or_default()
                        .push((entity.id.clone(), entity.layer));
                }
                None => stats.skipped += 1,
            }
        }

        for members in by_key.values() {
            for (i, (a, a_layer)) in members.iter().enumerate() {
                for (b, b_layer) in &members[i + 1..] {
                    if a_layer != b_layer && self.store.create_bridge(a, b).await? {
                        metrics::counter!("bridges_created_total").increment(1);
                        stats.bridges_created += 1;
                    }
                }
            }
        }

        if use_embeddings {
            stats.similarity_bridges = self.similarity_pass(&entities).await?;
        }

        info!(
            scanned = stats.scanned,
            normalized = stats.normalized,
            skipped = stats.skipped,
            bridges_created = stats.bridges_created,
            similarity_bridges = stats.similarity_bridges,
            "bridge backfill complete"
        );
        Ok(stats)
    }

    async fn similarity_pass(&self, entities: &[Entity]) -> Result<usize> {
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        let vectors: HashMap<EntityId, Vec<f32>> =
            self.store.entity_embeddings(&ids).await?.into_iter().collect();
        let keyed: Vec<(&Entity, Option<String>, &Vec<f32>)> = entities
            .iter()
            .filter_map(|e| {
                vectors
                    .get(&e.id)
                    .map(|v| (e, normalize_entity_name(&e.name), v))
            })
            .collect();

        let mut created = 0;
        for (i, (a, a_key, a_vec)) in keyed.iter().enumerate() {
            for (b, b_key, b_vec) in &keyed[i + 1..] {
                if a.layer == b.layer || (a_key.is_some() && a_key == b_key) {
                    continue;
                }
                if cosine_similarity(a_vec, b_vec) >= self.settings.similarity_threshold
                    && self.store.create_bridge(&a.id, &b.id).await?
                {
                    metrics::counter!("bridges_created_total").increment(1);
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Merge same-key entities within each layer.
    ///
    /// The master of a group is the smallest id. Summaries are unioned
    /// (sorted, `" | "`-joined), tags unioned, relationships re-pointed to
    /// the master; losers are flagged merged rather than deleted. A dry run
    /// only counts.
    pub async fn dedupe_entities(&self, batch_size: usize, dry_run: bool) -> Result<DedupeStats> {
        let entities = self.all_entities(batch_size).await?;
        let mut stats = DedupeStats {
            total_entities: entities.len(),
            ..DedupeStats::default()
        };

        let mut groups: BTreeMap<(Layer, String), Vec<&Entity>> = BTreeMap::new();
        for entity in &entities {
            if let Some(key) = normalize_entity_name(&entity.name) {
                groups.entry((entity.layer, key)).or_default().push(entity);
            }
        }
        stats.unique_groups = groups.len();

        for ((layer, key), mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
            stats.duplicates_found += members.len() - 1;
            if dry_run {
                debug!(layer = %layer, key = %key, count = members.len(), "duplicate group");
                continue;
            }

            let summaries: BTreeSet<&str> = members
                .iter()
                .map(|e| e.summary.trim())
                .filter(|s| !s.is_empty())
                .collect();
            let tags: BTreeSet<&String> = members.iter().flat_map(|e| &e.tags).collect();
            let patch = EntityPatch {
                summary: summaries.into_iter().collect::<Vec<_>>().join(" | "),
                tags: tags.into_iter().cloned().collect(),
            };

            let master = members[0].id.clone();
            let losers: Vec<EntityId> = members[1..].iter().map(|e| e.id.clone()).collect();
            let outcome = self.store.merge_entities(&master, &losers, patch).await?;
            stats.entities_merged += outcome.entities_merged;
            stats.relationships_transferred += outcome.relationships_transferred;
        }

        info!(
            total = stats.total_entities,
            groups = stats.unique_groups,
            duplicates = stats.duplicates_found,
            merged = stats.entities_merged,
            dry_run,
            "entity dedupe complete"
        );
        Ok(stats)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
