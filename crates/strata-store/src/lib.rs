//! # strata-store
//!
//! Graph persistence for the Strata memory engine.
//!
//! [`GraphStore`] is the contract the engine depends on. [`SqliteGraphStore`]
//! implements it on `SQLite`:
//!
//! - **Schema**: embedded migrations (`migrations/`), WAL mode, foreign keys
//! - **Repositories**: stateless `XRepo` types taking `&Connection`
//! - **Search**: FTS5 `bm25` and cosine similarity fused by reciprocal rank
//! - **Counters**: single-statement upsert-increment, safe across processes
//! - **Bridges**: ordered pairs under a primary key, inserted with `OR IGNORE`

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod graph;
pub mod migrations;
pub mod repositories;
pub mod sqlite_store;
pub mod types;

pub use connection::ConnectionConfig;
pub use errors::{Result, StoreError};
pub use graph::GraphStore;
pub use sqlite_store::SqliteGraphStore;
pub use types::{
    BridgedNeighbor, EntityPatch, MergeOutcome, NewCommunity, NewEntity, NewEpisode, NewFact,
    SearchHits, SearchRequest, TemporalFilter,
};
