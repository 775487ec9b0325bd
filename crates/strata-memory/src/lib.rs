//! # strata-memory
//!
//! The layered memory engine built on `strata-store`, `strata-embeddings`
//! and `strata-llm`:
//!
//! - **Normalizer / linker**: canonical entity keys and cross-layer bridges,
//!   plus the backfill and dedup batch tools
//! - **Ingestion**: idempotent, chunked, rate-limit aware write path
//! - **Retrieval**: hybrid search with score heuristics and bridge expansion
//! - **Context**: prompt-ready text within a token budget
//! - **Conversation**: turn ledger, buffers, turn and summary persistence on
//!   a supervised background queue
//! - **Engine**: the composition root wiring all of the above

#![deny(unsafe_code)]

pub mod context;
pub mod conversation;
pub mod engine;
pub mod errors;
pub mod extraction;
pub mod ingest;
pub mod ledger;
pub mod linker;
pub mod normalizer;
pub mod progress;
pub mod queue;
pub mod retrieval;

#[cfg(test)]
mod testing;

pub use context::{ContextAssembler, ContextResult, ContextSections};
pub use conversation::{
    BufferedTurn, ChatTurn, ConversationBuffers, ConversationRecorder, SummaryTurn,
    TurnDisposition, TurnReceipt,
};
pub use engine::{EngineParts, MemoryEngine};
pub use errors::{MemoryError, Result};
pub use extraction::{ExtractionOutcome, ExtractionService};
pub use ingest::{IngestOutcome, IngestRequest, IngestStatus, IngestionPipeline};
pub use ledger::TurnLedger;
pub use linker::{BackfillStats, CrossLayerLinker, DedupeStats, LinkStats};
pub use normalizer::normalize_entity_name;
pub use progress::{InMemoryJobs, JobRecord, JobStage, JobUpdate, NoopProgress, ProgressSink};
pub use queue::{BackgroundQueue, JobOutcome};
pub use retrieval::{FusionResult, LayerFilterStrategy, RetrievalFusion, Scored, SearchQuery};
