//! Authorship repository: users and the episodes they wrote.

use rusqlite::{Connection, params};
use strata_core::{EpisodeId, UserId};

use super::episode::EpisodeRepo;
use super::now;
use crate::errors::Result;

/// Authorship repository, stateless.
pub struct AuthorRepo;

impl AuthorRepo {
    /// Upsert the user and link it to the episode. Safe to repeat.
    pub fn attach(conn: &Connection, user: &UserId, episode: &EpisodeId) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![user.as_str(), now()],
        )?;
        let _ = tx.execute(
            "INSERT OR IGNORE INTO authorship (user_id, episode_id) VALUES (?1, ?2)",
            params![user.as_str(), episode.as_str()],
        )?;
        EpisodeRepo::set_author_if_missing(&tx, episode, user)?;
        tx.commit()?;
        Ok(())
    }

    /// Episode ids authored by `user`, oldest first.
    pub fn episodes_of(conn: &Connection, user: &UserId) -> Result<Vec<EpisodeId>> {
        let mut stmt = conn.prepare(
            "SELECT a.episode_id FROM authorship a
             JOIN episodes e ON e.id = a.episode_id
             WHERE a.user_id = ?1 ORDER BY e.created_at",
        )?;
        let rows = stmt
            .query_map(params![user.as_str()], |row| {
                row.get::<_, String>(0).map(EpisodeId::from)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
