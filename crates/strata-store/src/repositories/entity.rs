//! Entity repository: entities, mentions and entity merges.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use strata_core::vector::{from_blob, to_blob};
use strata_core::{Bridge, Entity, EntityId, EpisodeId, Layer};

use super::{in_clause, now, parse_json, parse_tag, parse_ts, text_values};
use crate::errors::{Result, StoreError};
use crate::types::{EntityPatch, MergeOutcome, NewEntity};

pub(crate) const COLUMNS: &str = "id, name, name_norm, layer, summary, tags, merged_into, created_at";

/// Entity repository, stateless.
pub struct EntityRepo;

impl EntityRepo {
    /// Insert the entity, or update the live entity with the same `(layer, name)`.
    ///
    /// On update, tags are unioned and an empty stored summary is replaced.
    pub fn upsert(conn: &Connection, new: &NewEntity) -> Result<Entity> {
        let existing = {
            let sql = format!(
                "SELECT {COLUMNS} FROM entities
                 WHERE layer = ?1 AND name = ?2 AND merged_into IS NULL
                 ORDER BY id LIMIT 1"
            );
            conn.query_row(&sql, params![new.layer.as_str(), new.name], map_entity)
                .optional()?
        };

        let Some(entity) = existing else {
            let id = EntityId::new();
            let _ = conn.execute(
                "INSERT INTO entities (id, name, layer, summary, tags, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    new.name,
                    new.layer.as_str(),
                    new.summary,
                    serde_json::to_string(&new.tags)?,
                    now(),
                ],
            )?;
            return Self::require(conn, &id);
        };

        let mut tags = entity.tags.clone();
        for tag in &new.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let summary = if entity.summary.is_empty() {
            new.summary.clone()
        } else {
            entity.summary.clone()
        };
        if tags != entity.tags || summary != entity.summary {
            let _ = conn.execute(
                "UPDATE entities SET summary = ?1, tags = ?2 WHERE id = ?3",
                params![summary, serde_json::to_string(&tags)?, entity.id.as_str()],
            )?;
            return Self::require(conn, &entity.id);
        }
        Ok(entity)
    }

    /// Get an entity by id, merged-away ones included.
    pub fn get(conn: &Connection, id: &EntityId) -> Result<Option<Entity>> {
        let sql = format!("SELECT {COLUMNS} FROM entities WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.as_str()], map_entity)
            .optional()?)
    }

    fn require(conn: &Connection, id: &EntityId) -> Result<Entity> {
        Self::get(conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "entity",
            id: id.to_string(),
        })
    }

    /// Record that `episode` mentions `entity`. Idempotent.
    pub fn mention(conn: &Connection, episode: &EpisodeId, entity: &EntityId) -> Result<()> {
        let _ = conn.execute(
            "INSERT OR IGNORE INTO mentions (episode_id, entity_id) VALUES (?1, ?2)",
            params![episode.as_str(), entity.as_str()],
        )?;
        Ok(())
    }

    /// Live entities mentioned by an episode.
    pub fn mentioned_by(conn: &Connection, episode: &EpisodeId) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {} FROM entities e
             JOIN mentions m ON m.entity_id = e.id
             WHERE m.episode_id = ?1 AND e.merged_into IS NULL
             ORDER BY e.id",
            prefixed("e")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![episode.as_str()], map_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Store the canonical linking key (`None` clears it).
    pub fn set_name_norm(conn: &Connection, id: &EntityId, key: Option<&str>) -> Result<()> {
        let _ = conn.execute(
            "UPDATE entities SET name_norm = ?1 WHERE id = ?2",
            params![key, id.as_str()],
        )?;
        Ok(())
    }

    /// Live entities carrying the canonical key, ordered by id.
    pub fn with_name_norm(conn: &Connection, key: &str) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM entities
             WHERE name_norm = ?1 AND merged_into IS NULL
             ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![key], map_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Page through live entities in id order.
    pub fn list(conn: &Connection, offset: usize, limit: usize) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM entities WHERE merged_into IS NULL
             ORDER BY id LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![to_i64(limit), to_i64(offset)], map_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Store or replace an entity's embedding.
    pub fn set_embedding(conn: &Connection, id: &EntityId, vector: &[f32]) -> Result<()> {
        let _ = conn.execute(
            "UPDATE entities SET embedding = ?1 WHERE id = ?2",
            params![to_blob(vector), id.as_str()],
        )?;
        Ok(())
    }

    /// Embeddings for the given entities; entities without one are omitted.
    pub fn embeddings(conn: &Connection, ids: &[EntityId]) -> Result<Vec<(EntityId, Vec<f32>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, embedding FROM entities WHERE embedding IS NOT NULL AND {}",
            in_clause("id", ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(text_values(ids)), |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((EntityId::from(id), from_blob(&blob)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fold `losers` into `master`.
    ///
    /// Relationships, mentions, bridges and community memberships move to
    /// the master. Relationships that would become self-loops stay on the
    /// loser. Losers are flagged `merged_into` and `deleted_at`, never
    /// deleted.
    pub fn merge(
        conn: &Connection,
        master: &EntityId,
        losers: &[EntityId],
        patch: &EntityPatch,
    ) -> Result<MergeOutcome> {
        let tx = conn.unchecked_transaction()?;
        let mut outcome = MergeOutcome::default();
        let stamp = now();

        for loser in losers.iter().filter(|l| *l != master) {
            let m = master.as_str();
            let l = loser.as_str();
            outcome.relationships_transferred += tx.execute(
                "UPDATE facts SET source_id = ?1 WHERE source_id = ?2 AND target_id <> ?1",
                params![m, l],
            )?;
            outcome.relationships_transferred += tx.execute(
                "UPDATE facts SET target_id = ?1 WHERE target_id = ?2 AND source_id <> ?1",
                params![m, l],
            )?;

            let _ = tx.execute(
                "INSERT OR IGNORE INTO mentions (episode_id, entity_id)
                 SELECT episode_id, ?1 FROM mentions WHERE entity_id = ?2",
                params![m, l],
            )?;
            let _ = tx.execute("DELETE FROM mentions WHERE entity_id = ?1", params![l])?;

            let others: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT high_id FROM bridges WHERE low_id = ?1
                     UNION SELECT low_id FROM bridges WHERE high_id = ?1",
                )?;
                stmt.query_map(params![l], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let _ = tx.execute(
                "DELETE FROM bridges WHERE low_id = ?1 OR high_id = ?1",
                params![l],
            )?;
            for other in others {
                if let Some(bridge) = Bridge::between(master.clone(), EntityId::from(other)) {
                    let _ = tx.execute(
                        "INSERT OR IGNORE INTO bridges (low_id, high_id, created_at) VALUES (?1, ?2, ?3)",
                        params![bridge.low.as_str(), bridge.high.as_str(), stamp],
                    )?;
                }
            }

            let _ = tx.execute(
                "INSERT OR IGNORE INTO community_members (community_id, entity_id)
                 SELECT community_id, ?1 FROM community_members WHERE entity_id = ?2",
                params![m, l],
            )?;
            let _ = tx.execute(
                "DELETE FROM community_members WHERE entity_id = ?1",
                params![l],
            )?;

            outcome.entities_merged += tx.execute(
                "UPDATE entities SET merged_into = ?1, deleted_at = ?2
                 WHERE id = ?3 AND merged_into IS NULL",
                params![m, stamp, l],
            )?;
        }

        let _ = tx.execute(
            "UPDATE entities SET summary = ?1, tags = ?2 WHERE id = ?3",
            params![patch.summary, serde_json::to_string(&patch.tags)?, master.as_str()],
        )?;
        tx.commit()?;
        Ok(outcome)
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub(crate) fn prefixed(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a row selected in [`COLUMNS`] order.
pub(crate) fn map_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    map_entity_at(row, 0)
}

/// Map entity columns that start at index `o` of the row.
pub(crate) fn map_entity_at(row: &Row<'_>, o: usize) -> rusqlite::Result<Entity> {
    let layer: String = row.get(o + 3)?;
    let tags: String = row.get(o + 5)?;
    let created_at: String = row.get(o + 7)?;
    let tags = match parse_json(o + 5, &tags)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    };
    Ok(Entity {
        id: EntityId::from(row.get::<_, String>(o)?),
        name: row.get(o + 1)?,
        name_norm: row.get(o + 2)?,
        layer: parse_tag::<Layer>(o + 3, &layer)?,
        summary: row.get(o + 4)?,
        tags,
        merged_into: row.get::<_, Option<String>>(o + 6)?.map(EntityId::from),
        created_at: parse_ts(o + 7, &created_at)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
