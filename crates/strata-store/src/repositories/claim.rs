//! Claim repository: at most one writer per `(layer, fingerprint)`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use strata_core::{ClaimId, Layer};

use super::{now, ts};
use crate::errors::Result;

/// Claim repository, stateless.
pub struct ClaimRepo;

impl ClaimRepo {
    /// Take the claim for `owner`. Returns `false` while another owner holds
    /// a claim newer than `stale_before`.
    ///
    /// A single upsert statement, so two processes sharing the database
    /// file can never both win.
    pub fn acquire(
        conn: &Connection,
        layer: Layer,
        fingerprint: &str,
        owner: &ClaimId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let won: Option<String> = conn
            .query_row(
                "INSERT INTO ingest_claims (layer, fingerprint, owner, claimed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (layer, fingerprint)
                 DO UPDATE SET owner = excluded.owner, claimed_at = excluded.claimed_at
                 WHERE ingest_claims.claimed_at < ?5
                 RETURNING owner",
                params![
                    layer.as_str(),
                    fingerprint,
                    owner.as_str(),
                    now(),
                    ts(stale_before)
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(won.as_deref() == Some(owner.as_str()))
    }

    /// Drop the claim if `owner` still holds it.
    pub fn release(conn: &Connection, layer: Layer, fingerprint: &str, owner: &ClaimId) -> Result<bool> {
        let n = conn.execute(
            "DELETE FROM ingest_claims WHERE layer = ?1 AND fingerprint = ?2 AND owner = ?3",
            params![layer.as_str(), fingerprint, owner.as_str()],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::conn;
    use chrono::Duration;

    fn long_ago() -> DateTime<Utc> {
        Utc::now() - Duration::hours(1)
    }

    #[test]
    fn second_owner_is_refused_until_release() {
        let conn = conn();
        let (a, b) = (ClaimId::new(), ClaimId::new());
        assert!(ClaimRepo::acquire(&conn, Layer::Knowledge, "fp", &a, long_ago()).unwrap());
        assert!(!ClaimRepo::acquire(&conn, Layer::Knowledge, "fp", &b, long_ago()).unwrap());

        // Only the holder can release.
        assert!(!ClaimRepo::release(&conn, Layer::Knowledge, "fp", &b).unwrap());
        assert!(ClaimRepo::release(&conn, Layer::Knowledge, "fp", &a).unwrap());
        assert!(ClaimRepo::acquire(&conn, Layer::Knowledge, "fp", &b, long_ago()).unwrap());
    }

    #[test]
    fn claims_are_scoped_per_layer() {
        let conn = conn();
        let (a, b) = (ClaimId::new(), ClaimId::new());
        assert!(ClaimRepo::acquire(&conn, Layer::Knowledge, "fp", &a, long_ago()).unwrap());
        assert!(ClaimRepo::acquire(&conn, Layer::Personal, "fp", &b, long_ago()).unwrap());
    }

    #[test]
    fn stale_claim_is_taken_over() {
        let conn = conn();
        let (a, b) = (ClaimId::new(), ClaimId::new());
        assert!(ClaimRepo::acquire(&conn, Layer::Project, "fp", &a, long_ago()).unwrap());
        // A cutoff in the future makes every existing claim stale.
        let future = Utc::now() + Duration::hours(1);
        assert!(ClaimRepo::acquire(&conn, Layer::Project, "fp", &b, future).unwrap());
        assert!(!ClaimRepo::release(&conn, Layer::Project, "fp", &a).unwrap());
    }
}
