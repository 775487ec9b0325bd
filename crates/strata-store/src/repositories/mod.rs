//! Stateless repositories. Every method takes a `&Connection`, so callers
//! decide pooling and transactions.

pub mod author;
pub mod bridge;
pub mod claim;
pub mod community;
pub mod counter;
pub mod entity;
pub mod episode;
pub mod fact;
pub mod search;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};

/// Format a timestamp the way every table stores it.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now() -> String {
    ts(Utc::now())
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_tag<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = strata_core::CoreError>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// `column IN (?, ?, ...)` with one placeholder per value.
pub(crate) fn in_clause(column: &str, count: usize) -> String {
    let marks = vec!["?"; count].join(", ");
    format!("{column} IN ({marks})")
}

pub(crate) fn text_values<I, S>(items: I) -> Vec<Value>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| Value::Text(s.as_ref().to_string()))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use rusqlite::Connection;

    /// Fresh in-memory database with the full schema.
    pub fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let _ = crate::migrations::run_migrations(&conn).unwrap();
        conn
    }
}
