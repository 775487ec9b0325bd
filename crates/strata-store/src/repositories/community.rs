//! Community repository: named entity clusters with summaries.

use rusqlite::{Connection, OptionalExtension, Row, params};
use strata_core::{Community, CommunityId, EntityId, Layer};

use super::{now, parse_tag};
use crate::errors::{Result, StoreError};
use crate::types::NewCommunity;

pub(crate) const COLUMNS: &str = "id, layer, name, summary";

/// Community repository, stateless.
pub struct CommunityRepo;

impl CommunityRepo {
    /// Insert, or refresh the summary of the community with the same `(layer, name)`.
    pub fn upsert(conn: &Connection, new: &NewCommunity) -> Result<Community> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM communities WHERE layer = ?1 AND name = ?2",
                params![new.layer.as_str(), new.name],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => {
                let _ = conn.execute(
                    "UPDATE communities SET summary = ?1 WHERE id = ?2",
                    params![new.summary, id],
                )?;
                CommunityId::from(id)
            }
            None => {
                let id = CommunityId::new();
                let _ = conn.execute(
                    "INSERT INTO communities (id, layer, name, summary, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id.as_str(), new.layer.as_str(), new.name, new.summary, now()],
                )?;
                id
            }
        };
        let sql = format!("SELECT {COLUMNS} FROM communities WHERE id = ?1");
        conn.query_row(&sql, params![id.as_str()], map_community)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "community",
                id: id.to_string(),
            })
    }

    /// Add an entity to a community. Idempotent.
    pub fn add_member(conn: &Connection, community: &CommunityId, entity: &EntityId) -> Result<()> {
        let _ = conn.execute(
            "INSERT OR IGNORE INTO community_members (community_id, entity_id) VALUES (?1, ?2)",
            params![community.as_str(), entity.as_str()],
        )?;
        Ok(())
    }

    /// Member ids of a community.
    pub fn members(conn: &Connection, community: &CommunityId) -> Result<Vec<EntityId>> {
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM community_members WHERE community_id = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt
            .query_map(params![community.as_str()], |row| {
                row.get::<_, String>(0).map(EntityId::from)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub(crate) fn map_community(row: &Row<'_>) -> rusqlite::Result<Community> {
    let layer: String = row.get(1)?;
    Ok(Community {
        id: CommunityId::from(row.get::<_, String>(0)?),
        layer: parse_tag::<Layer>(1, &layer)?,
        name: row.get(2)?,
        summary: row.get(3)?,
    })
}
