//! Episode repository: CRUD for the `episodes` table.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use strata_core::vector::{from_blob, to_blob};
use strata_core::{ConversationId, Episode, EpisodeId, EpisodeKind, Layer, UserId};

use super::{now, parse_json, parse_tag, parse_ts, ts};
use crate::errors::{Result, StoreError};
use crate::types::NewEpisode;

pub(crate) const COLUMNS: &str = "id, name, content, layer, fingerprint, kind, source_description, \
     author_id, conversation_id, turn_index, is_correction, summarized, metadata, created_at, valid_at";

/// Metadata keys that also live in their own column.
const MIRRORED_KEYS: &[&str] = &[
    "conversation_id",
    "turn_index",
    "episode_kind",
    "is_correction",
    "summarized",
];

/// Episode repository, stateless.
pub struct EpisodeRepo;

impl EpisodeRepo {
    /// Insert an episode and return the stored record.
    pub fn insert(conn: &Connection, new: &NewEpisode) -> Result<Episode> {
        let id = new.id.clone().unwrap_or_default();
        let metadata = match &new.metadata {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let _ = conn.execute(
            "INSERT INTO episodes (id, name, content, layer, fingerprint, kind, source_description,
                                   conversation_id, turn_index, is_correction, summarized, metadata,
                                   created_at, valid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13)",
            params![
                id.as_str(),
                new.name,
                new.content,
                new.layer.map(Layer::as_str),
                new.fingerprint,
                new.kind.map(EpisodeKind::as_str),
                new.source_description,
                new.conversation_id.as_ref().map(ConversationId::as_str),
                new.turn_index,
                new.is_correction,
                serde_json::to_string(&metadata)?,
                now(),
                ts(new.valid_at),
            ],
        )?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound {
            kind: "episode",
            id: id.to_string(),
        })
    }

    /// Get an episode by id.
    pub fn get(conn: &Connection, id: &EpisodeId) -> Result<Option<Episode>> {
        let sql = format!("SELECT {COLUMNS} FROM episodes WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.as_str()], map_episode)
            .optional()?)
    }

    /// Oldest episode in `layer` with the given fingerprint.
    pub fn find_by_fingerprint(
        conn: &Connection,
        layer: Layer,
        fingerprint: &str,
    ) -> Result<Option<Episode>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM episodes
             WHERE layer = ?1 AND fingerprint = ?2
             ORDER BY created_at ASC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![layer.as_str(), fingerprint], map_episode)
            .optional()?)
    }

    /// Most recent episode with exactly this content and source.
    ///
    /// A missing layer tag still matches, since the writer may not have
    /// stamped it yet.
    pub fn find_by_content(
        conn: &Connection,
        layer: Layer,
        content: &str,
        source_description: &str,
    ) -> Result<Option<Episode>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM episodes
             WHERE content = ?1 AND source_description = ?2 AND (layer = ?3 OR layer IS NULL)
             ORDER BY created_at DESC LIMIT 1"
        );
        Ok(conn
            .query_row(
                &sql,
                params![content, source_description, layer.as_str()],
                map_episode,
            )
            .optional()?)
    }

    /// Store or replace the episode's embedding.
    pub fn set_embedding(conn: &Connection, id: &EpisodeId, vector: &[f32]) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE episodes SET embedding = ?1 WHERE id = ?2",
            params![to_blob(vector), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Stored embedding, if any.
    pub fn get_embedding(conn: &Connection, id: &EpisodeId) -> Result<Option<Vec<f32>>> {
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT embedding FROM episodes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten().map(|b| from_blob(&b)).filter(|v| !v.is_empty()))
    }

    /// Stamp the layer only when none is set. Returns whether a row changed.
    pub fn set_layer_if_missing(conn: &Connection, id: &EpisodeId, layer: Layer) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE episodes SET layer = ?1 WHERE id = ?2 AND layer IS NULL",
            params![layer.as_str(), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite the fingerprint.
    pub fn set_fingerprint(conn: &Connection, id: &EpisodeId, fingerprint: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE episodes SET fingerprint = ?1 WHERE id = ?2",
            params![fingerprint, id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Merge `patch` into the metadata object and mirror known keys to columns.
    pub fn update_metadata(conn: &Connection, id: &EpisodeId, patch: &Value) -> Result<()> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidOperation(
                "metadata patch must be a JSON object".into(),
            ));
        };
        let episode = Self::get(conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "episode",
            id: id.to_string(),
        })?;
        let mut merged = match episode.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            let _ = merged.insert(key.clone(), value.clone());
        }

        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute(
            "UPDATE episodes SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&merged)?, id.as_str()],
        )?;
        for key in MIRRORED_KEYS {
            let Some(value) = patch.get(*key) else {
                continue;
            };
            mirror_column(&tx, id, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record the author on the episode row unless one is already set.
    pub fn set_author_if_missing(conn: &Connection, id: &EpisodeId, user: &UserId) -> Result<()> {
        let _ = conn.execute(
            "UPDATE episodes SET author_id = ?1 WHERE id = ?2 AND author_id IS NULL",
            params![user.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    /// Number of stored turn episodes authored by `user` in `conversation`.
    pub fn count_turns(conn: &Connection, user: &UserId, conversation: &ConversationId) -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM episodes e
             JOIN authorship a ON a.episode_id = e.id
             WHERE a.user_id = ?1 AND e.conversation_id = ?2 AND e.kind = ?3",
            params![
                user.as_str(),
                conversation.as_str(),
                EpisodeKind::ChatTurn.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Turn episodes of a conversation with `from <= turn_index <= to`, in turn order.
    pub fn turns_in_range(
        conn: &Connection,
        user: &UserId,
        conversation: &ConversationId,
        from: i64,
        to: i64,
    ) -> Result<Vec<Episode>> {
        let sql = format!(
            "SELECT {} FROM episodes e
             JOIN authorship a ON a.episode_id = e.id
             WHERE a.user_id = ?1 AND e.conversation_id = ?2 AND e.kind = ?3
               AND e.turn_index BETWEEN ?4 AND ?5
             ORDER BY e.turn_index ASC",
            prefixed_columns("e")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    user.as_str(),
                    conversation.as_str(),
                    EpisodeKind::ChatTurn.as_str(),
                    from,
                    to
                ],
                map_episode,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn mirror_column(conn: &Connection, id: &EpisodeId, key: &str, value: &Value) -> Result<()> {
    let (column, sql_value): (&str, rusqlite::types::Value) = match key {
        "conversation_id" => ("conversation_id", json_text(value)),
        "turn_index" => (
            "turn_index",
            value
                .as_i64()
                .map_or(rusqlite::types::Value::Null, rusqlite::types::Value::Integer),
        ),
        "episode_kind" => {
            let kind = value.as_str().and_then(|s| s.parse::<EpisodeKind>().ok());
            (
                "kind",
                kind.map_or(rusqlite::types::Value::Null, |k| {
                    rusqlite::types::Value::Text(k.as_str().to_string())
                }),
            )
        }
        "is_correction" => (
            "is_correction",
            rusqlite::types::Value::Integer(i64::from(value.as_bool().unwrap_or(false))),
        ),
        "summarized" => (
            "summarized",
            rusqlite::types::Value::Integer(i64::from(value.as_bool().unwrap_or(false))),
        ),
        _ => return Ok(()),
    };
    let sql = format!("UPDATE episodes SET {column} = ?1 WHERE id = ?2");
    let _ = conn.execute(&sql, params![sql_value, id.as_str()])?;
    Ok(())
}

fn json_text(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// `COLUMNS` qualified with a table alias.
pub(crate) fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a row selected with [`COLUMNS`] order.
pub(crate) fn map_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let layer: Option<String> = row.get(3)?;
    let kind: Option<String> = row.get(5)?;
    let metadata: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    let valid_at: String = row.get(14)?;
    Ok(Episode {
        id: EpisodeId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        content: row.get(2)?,
        layer: layer.map(|l| parse_tag(3, &l)).transpose()?,
        fingerprint: row.get(4)?,
        kind: kind.map(|k| parse_tag(5, &k)).transpose()?,
        source_description: row.get(6)?,
        author: row.get::<_, Option<String>>(7)?.map(UserId::from),
        conversation_id: row.get::<_, Option<String>>(8)?.map(ConversationId::from),
        turn_index: row.get(9)?,
        is_correction: row.get(10)?,
        summarized: row.get(11)?,
        metadata: parse_json(12, &metadata)?,
        created_at: parse_ts(13, &created_at)?,
        valid_at: parse_ts(14, &valid_at)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
