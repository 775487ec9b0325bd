//! Composition root: builds every service once from [`StrataSettings`] and
//! the injected collaborators, and tears them down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{JobId, Layer};
use strata_embeddings::{CacheConfig, CacheStats, CachedEmbedder, EmbeddingCache, EmbeddingProvider};
use strata_llm::ChatProvider;
use strata_settings::StrataSettings;
use strata_store::GraphStore;
use tracing::{info, warn};

use crate::context::{ContextAssembler, ContextResult};
use crate::conversation::{ChatTurn, ConversationBuffers, ConversationRecorder, TurnReceipt};
use crate::errors::Result;
use crate::extraction::ExtractionService;
use crate::ingest::{IngestOutcome, IngestRequest, IngestionPipeline};
use crate::ledger::TurnLedger;
use crate::linker::CrossLayerLinker;
use crate::progress::{InMemoryJobs, JobStage, JobUpdate, ProgressSink};
use crate::queue::BackgroundQueue;
use crate::retrieval::{FusionResult, RetrievalFusion, SearchQuery};

/// Results fetched per collection when building context.
pub const CONTEXT_SEARCH_LIMIT: usize = 8;

/// External collaborators the engine is built around.
pub struct EngineParts {
    /// Graph store.
    pub store: Arc<dyn GraphStore>,
    /// Knowledge extraction service.
    pub extractor: Arc<dyn ExtractionService>,
    /// Raw embedding provider; the engine wraps it with the cache.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// Chat provider for summaries; placeholders are stored without one.
    pub chat: Option<Arc<dyn ChatProvider>>,
}

/// The memory engine.
///
/// Must be built inside a Tokio runtime: the background queue spawns its
/// workers on construction.
pub struct MemoryEngine {
    cache: Arc<EmbeddingCache>,
    linker: CrossLayerLinker,
    pipeline: IngestionPipeline,
    retrieval: RetrievalFusion,
    assembler: ContextAssembler,
    ledger: TurnLedger,
    recorder: ConversationRecorder,
    jobs: InMemoryJobs,
    queue: Arc<BackgroundQueue>,
    settings: StrataSettings,
}

impl MemoryEngine {
    /// Wire every service.
    pub fn new(settings: StrataSettings, parts: EngineParts) -> Self {
        let EngineParts {
            store,
            extractor,
            embedder,
            chat,
        } = parts;

        let cache = Arc::new(EmbeddingCache::new(CacheConfig::from_settings(&settings.cache)));
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(CachedEmbedder::new(embedder, cache.clone()));
        let jobs = InMemoryJobs::new();

        let linker = CrossLayerLinker::new(store.clone(), settings.linker.clone());
        let pipeline = IngestionPipeline::new(
            store.clone(),
            extractor,
            embedder.clone(),
            linker.clone(),
            settings.retry.clone(),
            settings.ingest.clone(),
        )
        .with_progress(Arc::new(jobs.clone()));
        let retrieval = RetrievalFusion::new(store.clone(), embedder, settings.retrieval.clone());
        let assembler = ContextAssembler::new(settings.context.clone());
        let ledger = TurnLedger::new(store.clone());

        let conversation = &settings.conversation;
        // Turn persistence and summarization each get the persist timeout.
        let job_timeout = Duration::from_secs(conversation.persist_timeout_secs.saturating_mul(2));
        let queue = Arc::new(BackgroundQueue::start(
            conversation.queue_capacity,
            conversation.queue_workers,
            job_timeout,
        ));
        let recorder = ConversationRecorder::new(
            store,
            ledger.clone(),
            pipeline.clone(),
            chat,
            ConversationBuffers::new(conversation.buffer_max_messages),
            queue.clone(),
            conversation.clone(),
            settings.ingest.long_message_chars,
        );

        info!(
            write_concurrency = settings.ingest.write_concurrency,
            queue_workers = conversation.queue_workers,
            "memory engine ready"
        );
        Self {
            cache,
            linker,
            pipeline,
            retrieval,
            assembler,
            ledger,
            recorder,
            jobs,
            queue,
            settings,
        }
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &StrataSettings {
        &self.settings
    }

    /// Ingestion pipeline.
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Cross-layer linker and its batch tools.
    pub fn linker(&self) -> &CrossLayerLinker {
        &self.linker
    }

    /// Retrieval engine.
    pub fn retrieval(&self) -> &RetrievalFusion {
        &self.retrieval
    }

    /// Turn ledger.
    pub fn ledger(&self) -> &TurnLedger {
        &self.ledger
    }

    /// Chat-turn recorder.
    pub fn recorder(&self) -> &ConversationRecorder {
        &self.recorder
    }

    /// Job registry fed by ingestion.
    pub fn jobs(&self) -> &InMemoryJobs {
        &self.jobs
    }

    /// Background queue.
    pub fn queue(&self) -> &Arc<BackgroundQueue> {
        &self.queue
    }

    /// Ingest and wait for the outcome.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        self.pipeline.ingest(request).await
    }

    /// Ingest in the background; progress is readable through [`Self::jobs`].
    pub fn submit_ingest(&self, request: IngestRequest) -> Result<JobId> {
        let job = self.jobs.create();
        let pipeline = self.pipeline.clone();
        let request = request.job(job.clone());
        let accepted = self.queue.try_submit("ingest", async move {
            let _ = pipeline.ingest(request).await?;
            Ok(())
        })?;
        if !accepted {
            self.jobs.update(
                &job,
                JobUpdate {
                    stage: Some(JobStage::Error),
                    message: Some("background queue full".to_string()),
                    ..JobUpdate::default()
                },
            );
        }
        Ok(job)
    }

    /// Fused search.
    pub async fn search(&self, query: &SearchQuery) -> Result<FusionResult> {
        self.retrieval.search(query).await
    }

    /// Search and assemble prompt context within `max_tokens`.
    pub async fn build_context(
        &self,
        query: &str,
        layers: &[Layer],
        max_tokens: usize,
    ) -> Result<ContextResult> {
        let result = self
            .retrieval
            .search(&SearchQuery::new(query, CONTEXT_SEARCH_LIMIT).layers(layers.iter().copied()))
            .await?;
        Ok(self.assembler.assemble_within(&result, query, max_tokens))
    }

    /// Record a chat exchange.
    pub async fn record_turn(&self, turn: ChatTurn) -> Result<TurnReceipt> {
        self.recorder.record_turn(turn).await
    }

    /// Embedding cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Housekeeping: idle buffers, finished jobs, expired cache entries.
    pub fn maintain(&self) {
        let idle = chrono::Duration::hours(
            i64::try_from(self.settings.conversation.buffer_idle_hours).unwrap_or(i64::MAX),
        );
        let buffers = self.recorder.buffers().evict_idle(idle);
        let jobs = self.jobs.prune_finished(idle);
        let expired = self.cache.cleanup_expired();
        info!(buffers, jobs, expired, "maintenance pass");
    }

    /// Drain background work and persist the embedding cache.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        if let Err(e) = self.cache.save_async().await {
            warn!(error = %e, "failed to save embedding cache");
        }
        info!("memory engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestStatus;
    use crate::testing::{FixedChat, ScriptedExtractor};
    use strata_core::{ConversationId, UserId};
    use strata_embeddings::HashEmbedder;
    use strata_settings::CacheSettings;
    use strata_store::SqliteGraphStore;

    fn engine(dir: &tempfile::TempDir) -> MemoryEngine {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let settings = StrataSettings {
            cache: CacheSettings {
                path: Some(dir.path().join("cache.json")),
                ..CacheSettings::default()
            },
            ..StrataSettings::default()
        };
        MemoryEngine::new(
            settings,
            EngineParts {
                store: store.clone(),
                extractor: ScriptedExtractor::new(store, vec![]),
                embedder: Arc::new(HashEmbedder::new(8)),
                chat: Some(FixedChat::replying("summary")),
            },
        )
    }

    #[tokio::test]
    async fn background_ingest_reports_through_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let job = engine
            .submit_ingest(IngestRequest::new("Lena is a designer in Riga.", Layer::Knowledge))
            .unwrap();
        engine.queue().wait_idle().await;
        let record = engine.jobs().get(&job).unwrap();
        assert_eq!(record.stage, JobStage::Done);
        assert_eq!(record.total, 1);

        let again = engine
            .ingest(IngestRequest::new("Lena is a designer in Riga.", Layer::Knowledge))
            .await
            .unwrap();
        assert_eq!(again.status, IngestStatus::Skipped);
    }

    #[tokio::test]
    async fn context_is_built_from_search() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let _ = engine
            .ingest(IngestRequest::new(
                "Lena is a designer who has worked in Riga for three years.",
                Layer::Knowledge,
            ))
            .await
            .unwrap();
        let ctx = engine
            .build_context("Lena", &[Layer::Knowledge], 4000)
            .await
            .unwrap();
        assert_eq!(ctx.sections.episodes, 1);
        assert!(ctx.text.contains("- Lena is a designer"));
        assert!(engine.cache_stats().size > 0);
    }

    #[tokio::test]
    async fn shutdown_drains_turns_and_saves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let user = UserId::from("u1");
        let conv = ConversationId::from("c1");
        let receipt = engine
            .record_turn(ChatTurn {
                user: user.clone(),
                conversation: Some(conv.clone()),
                user_message: "hello".into(),
                assistant_message: "hi".into(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.turn_index, Some(1));

        engine.shutdown().await;
        assert_eq!(engine.ledger().turn_count(&user, &conv).await.unwrap(), 1);
        assert!(dir.path().join("cache.json").exists());
        engine.maintain();
    }
}
