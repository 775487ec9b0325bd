//! # strata-core
//!
//! Foundation types and utilities for the Strata memory engine.
//!
//! This crate provides the shared vocabulary that all other Strata crates depend on:
//!
//! - **Layers**: [`Layer`] partitions and [`EpisodeKind`] tags
//! - **Branded IDs**: `EpisodeId`, `EntityId`, `FactId` and friends as newtypes
//! - **Records**: [`Episode`], [`Entity`], [`Bridge`], [`Fact`], [`Community`]
//! - **Text**: normalization, fingerprints, correction markers, semantic chunking
//! - **Vectors**: cosine similarity, averaging, blob encoding
//! - **Retry**: [`RetryPolicy`] and backoff math shared by the retry executor
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod layer;
pub mod logging;
pub mod records;
pub mod retry;
pub mod text;
pub mod vector;

pub use errors::{CoreError, Result};
pub use ids::{ClaimId, CommunityId, ConversationId, EntityId, EpisodeId, FactId, JobId, UserId};
pub use layer::{EpisodeKind, Layer};
pub use records::{Bridge, Community, Entity, Episode, Fact};
pub use retry::RetryPolicy;
