//! Fact repository: directed, layer-scoped relationships with validity windows.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use strata_core::{EntityId, EpisodeId, Fact, FactId, Layer};

use super::{in_clause, now, parse_opt_ts, parse_tag, parse_ts, text_values, ts};
use crate::errors::{Result, StoreError};
use crate::types::{NewFact, TemporalFilter};

/// Select list joining both endpoint names. Alias `f` is the facts table.
pub(crate) const SELECT: &str = "SELECT f.id, f.layer, f.source_id, f.target_id, s.name, t.name, \
     f.relation, f.fact, f.valid_at, f.invalid_at, f.created_at \
     FROM facts f JOIN entities s ON s.id = f.source_id JOIN entities t ON t.id = f.target_id";

/// Fact repository, stateless.
pub struct FactRepo;

impl FactRepo {
    /// Insert a relationship.
    pub fn insert(conn: &Connection, new: &NewFact) -> Result<Fact> {
        let id = FactId::new();
        let _ = conn.execute(
            "INSERT INTO facts (id, layer, source_id, target_id, relation, fact, valid_at, episode_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.as_str(),
                new.layer.as_str(),
                new.source.as_str(),
                new.target.as_str(),
                new.relation,
                new.fact,
                new.valid_at.map(ts),
                new.episode.as_ref().map(EpisodeId::as_str),
                now(),
            ],
        )?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound {
            kind: "fact",
            id: id.to_string(),
        })
    }

    /// Get a fact by id.
    pub fn get(conn: &Connection, id: &FactId) -> Result<Option<Fact>> {
        let sql = format!("{SELECT} WHERE f.id = ?1");
        Ok(conn
            .query_row(&sql, params![id.as_str()], map_fact)
            .optional()?)
    }

    /// Close the validity window at `at`. Returns whether the fact was open.
    pub fn invalidate(conn: &Connection, id: &FactId, at: DateTime<Utc>) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE facts SET invalid_at = ?1 WHERE id = ?2 AND invalid_at IS NULL",
            params![ts(at), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Relationships whose subject is one of `entity_ids`, passing `temporal`.
    pub fn outgoing(
        conn: &Connection,
        entity_ids: &[EntityId],
        temporal: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        if entity_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut values = text_values(entity_ids);
        let (temporal_sql, temporal_values) = temporal_clause("f", temporal);
        values.extend(temporal_values);
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let sql = format!(
            "{SELECT} WHERE {} AND {temporal_sql} ORDER BY f.created_at DESC LIMIT ?",
            in_clause("f.source_id", entity_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), map_fact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// SQL predicate and bound values for a temporal filter on alias `alias`.
pub(crate) fn temporal_clause(alias: &str, temporal: TemporalFilter) -> (String, Vec<Value>) {
    match temporal {
        TemporalFilter::Current => (format!("{alias}.invalid_at IS NULL"), Vec::new()),
        TemporalFilter::AsOf(at) => {
            let at = ts(at);
            (
                format!(
                    "({alias}.valid_at IS NULL OR {alias}.valid_at <= ?) \
                     AND ({alias}.invalid_at IS NULL OR {alias}.invalid_at > ?)"
                ),
                vec![Value::Text(at.clone()), Value::Text(at)],
            )
        }
    }
}

/// Map a row selected with [`SELECT`].
pub(crate) fn map_fact(row: &Row<'_>) -> rusqlite::Result<Fact> {
    let layer: String = row.get(1)?;
    let created_at: String = row.get(10)?;
    Ok(Fact {
        id: FactId::from(row.get::<_, String>(0)?),
        layer: parse_tag::<Layer>(1, &layer)?,
        source: EntityId::from(row.get::<_, String>(2)?),
        target: EntityId::from(row.get::<_, String>(3)?),
        source_name: row.get(4)?,
        target_name: row.get(5)?,
        relation: row.get(6)?,
        fact: row.get(7)?,
        valid_at: parse_opt_ts(8, row.get(8)?)?,
        invalid_at: parse_opt_ts(9, row.get(9)?)?,
        created_at: parse_ts(10, &created_at)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
