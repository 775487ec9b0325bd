//! Counter repository: per-(user, conversation) turn counters.

use rusqlite::{Connection, OptionalExtension, params};
use strata_core::{ConversationId, UserId};

use super::now;
use crate::errors::Result;

/// Counter repository, stateless.
pub struct CounterRepo;

impl CounterRepo {
    /// Create-or-increment the counter and return the new value.
    ///
    /// A single upsert statement, so it stays atomic across processes that
    /// share the database file. The first call returns 1.
    pub fn increment(conn: &Connection, user: &UserId, conversation: &ConversationId) -> Result<i64> {
        let value = conn.query_row(
            "INSERT INTO counters (user_id, conversation_id, value, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (user_id, conversation_id)
             DO UPDATE SET value = value + 1, updated_at = excluded.updated_at
             RETURNING value",
            params![user.as_str(), conversation.as_str(), now()],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Current value, if the counter exists.
    pub fn get(conn: &Connection, user: &UserId, conversation: &ConversationId) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT value FROM counters WHERE user_id = ?1 AND conversation_id = ?2",
                params![user.as_str(), conversation.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }
}
