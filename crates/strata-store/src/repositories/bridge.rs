//! Bridge repository: identity links between same-named entities.

use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use strata_core::{Bridge, EntityId, Layer};

use super::entity::{map_entity_at, prefixed};
use super::{in_clause, now, text_values};
use crate::errors::Result;
use crate::types::BridgedNeighbor;

/// Bridge repository, stateless.
pub struct BridgeRepo;

impl BridgeRepo {
    /// Create the bridge `{a, b}` unless it exists.
    ///
    /// The pair is stored smaller id first and inserted with `OR IGNORE`
    /// against the primary key, so concurrent writers cannot duplicate it.
    /// Returns `true` only when this call created the row.
    pub fn create(conn: &Connection, a: &EntityId, b: &EntityId) -> Result<bool> {
        let Some(bridge) = Bridge::between(a.clone(), b.clone()) else {
            return Ok(false);
        };
        let changed = conn.execute(
            "INSERT OR IGNORE INTO bridges (low_id, high_id, created_at) VALUES (?1, ?2, ?3)",
            params![bridge.low.as_str(), bridge.high.as_str(), now()],
        )?;
        Ok(changed > 0)
    }

    /// Live entities bridged to any of `entity_ids` and living in a
    /// different layer than the entity they were reached from.
    ///
    /// `allowed_layers` restricts the neighbor layer when non-empty.
    pub fn neighbors(
        conn: &Connection,
        entity_ids: &[EntityId],
        allowed_layers: &[Layer],
        limit: usize,
    ) -> Result<Vec<BridgedNeighbor>> {
        if entity_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut values = text_values(entity_ids);
        values.extend(text_values(entity_ids));
        let mut layer_sql = String::new();
        if !allowed_layers.is_empty() {
            layer_sql = format!(" AND {}", in_clause("n.layer", allowed_layers.len()));
            values.extend(text_values(allowed_layers.iter().map(|l| l.as_str())));
        }
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT b.src, {cols} FROM (
               SELECT low_id AS src, high_id AS dst FROM bridges WHERE {low_in}
               UNION
               SELECT high_id AS src, low_id AS dst FROM bridges WHERE {high_in}
             ) b
             JOIN entities s ON s.id = b.src
             JOIN entities n ON n.id = b.dst
             WHERE n.merged_into IS NULL AND n.layer <> s.layer{layer_sql}
             ORDER BY b.src, n.id
             LIMIT ?",
            cols = prefixed("n"),
            low_in = in_clause("low_id", entity_ids.len()),
            high_in = in_clause("high_id", entity_ids.len()),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let from: String = row.get(0)?;
                let entity = map_entity_at(row, 1)?;
                Ok(BridgedNeighbor {
                    from: EntityId::from(from),
                    entity,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total bridge count.
    pub fn count(conn: &Connection) -> Result<u64> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM bridges", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
