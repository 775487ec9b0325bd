//! # Ingestion Pipeline
//!
//! Idempotent write path from raw text to stored episodes:
//!
//! 1. Reject blank text.
//! 2. Look the content fingerprint up in the target layer; a hit returns
//!    `skipped` without calling the extraction service. Otherwise claim the
//!    `(layer, fingerprint)` pair in the store. A concurrent writer of the
//!    same text (in this process or another) waits on the claim and then
//!    returns the winner's episode as a duplicate.
//! 3. Split long text into chunks, each written as its own episode with
//!    `(part i/n)` in its source description.
//! 4. Call the extraction service per chunk under the retry executor and the
//!    process-wide write limiter. A validation failure is recovered by
//!    finding the episode the service most likely wrote anyway.
//! 5. Stamp fingerprint, layer and metadata, enforce and verify the
//!    embedding, attach the author, link entities across layers.
//! 6. Resolve the final stage and report.
//!
//! Store failures on the lookup paths propagate. The post-write stamping is
//! best-effort and turns into warnings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strata_core::text::{fingerprint, split_into_chunks, truncate_chars};
use strata_core::{ClaimId, EpisodeId, EpisodeKind, JobId, Layer, RetryPolicy, UserId};
use strata_embeddings::EmbeddingProvider;
use strata_llm::{ExtractionRequest, RetryExecutor};
use strata_settings::IngestSettings;
use strata_store::GraphStore;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::errors::{MemoryError, Result};
use crate::extraction::{ExtractionOutcome, ExtractionService};
use crate::linker::CrossLayerLinker;
use crate::progress::{JobStage, JobUpdate, NoopProgress, ProgressSink};

/// Longest episode name sent to the extraction service.
const MAX_NAME_CHARS: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Request / outcome
// ─────────────────────────────────────────────────────────────────────────────

/// One ingestion call.
#[derive(Clone, Debug)]
pub struct IngestRequest {
    /// Raw text.
    pub text: String,
    /// Target layer.
    pub layer: Layer,
    /// Where the text came from.
    pub source_description: String,
    /// Author to attach.
    pub author: Option<UserId>,
    /// Episode kind. Chat turns and summaries bypass the duplicate check.
    pub kind: EpisodeKind,
    /// Extra metadata merged into every written episode.
    pub metadata: Value,
    /// Job to report progress to.
    pub job: Option<JobId>,
}

impl IngestRequest {
    /// Document ingest of `text` into `layer`.
    pub fn new(text: impl Into<String>, layer: Layer) -> Self {
        Self {
            text: text.into(),
            layer,
            source_description: "uploaded_text".to_string(),
            author: None,
            kind: EpisodeKind::Document,
            metadata: json!({}),
            job: None,
        }
    }

    /// Set the source description.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source_description = source.into();
        self
    }

    /// Set the author.
    #[must_use]
    pub fn author(mut self, author: UserId) -> Self {
        self.author = Some(author);
        self
    }

    /// Set the episode kind.
    #[must_use]
    pub fn kind(mut self, kind: EpisodeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set extra metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Report progress to `job`.
    #[must_use]
    pub fn job(mut self, job: JobId) -> Self {
        self.job = Some(job);
        self
    }

    fn bypasses_duplicate_check(&self) -> bool {
        matches!(self.kind, EpisodeKind::ChatTurn | EpisodeKind::ChatSummary)
    }
}

/// Caller-visible status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// At least one episode was written.
    Success,
    /// Duplicate of an existing episode.
    Skipped,
    /// Nothing was written.
    Error,
}

impl IngestStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// Result of one ingestion call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Status.
    pub status: IngestStatus,
    /// Written episodes in chunk order, or the existing duplicate.
    pub episode_ids: Vec<EpisodeId>,
    /// Why the call was skipped or failed.
    pub reason: Option<String>,
    /// Chunks the text was split into.
    pub chunks: usize,
    /// Episodes written.
    pub added: usize,
    /// Warnings and per-chunk errors.
    pub warnings: Vec<String>,
    /// Final job stage.
    pub stage: JobStage,
    /// Wall time in seconds.
    pub elapsed_secs: f64,
}

impl IngestOutcome {
    /// First written (or duplicate) episode.
    pub fn episode_id(&self) -> Option<&EpisodeId> {
        self.episode_ids.first()
    }

    fn rejected(reason: String, started: Instant) -> Self {
        Self {
            status: IngestStatus::Error,
            episode_ids: Vec::new(),
            reason: Some(reason),
            chunks: 0,
            added: 0,
            warnings: Vec::new(),
            stage: JobStage::Error,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    fn in_progress(started: Instant) -> Self {
        Self {
            status: IngestStatus::Skipped,
            episode_ids: Vec::new(),
            reason: Some("in_progress".to_string()),
            chunks: 0,
            added: 0,
            warnings: Vec::new(),
            stage: JobStage::Done,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    fn duplicate(existing: EpisodeId, started: Instant) -> Self {
        Self {
            status: IngestStatus::Skipped,
            episode_ids: vec![existing],
            reason: Some("duplicate".to_string()),
            chunks: 0,
            added: 0,
            warnings: Vec::new(),
            stage: JobStage::Done,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

enum ClaimState {
    Claimed,
    Duplicate(EpisodeId),
    /// Another writer kept the claim past the wait budget.
    Busy,
}

/// The write path. Clones share the write limiter.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn ExtractionService>,
    embedder: Arc<dyn EmbeddingProvider>,
    linker: CrossLayerLinker,
    retry: RetryExecutor,
    write_limiter: Arc<Semaphore>,
    progress: Arc<dyn ProgressSink>,
    settings: IngestSettings,
}

impl IngestionPipeline {
    /// Pipeline with its own write limiter of `settings.write_concurrency`.
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn ExtractionService>,
        embedder: Arc<dyn EmbeddingProvider>,
        linker: CrossLayerLinker,
        retry: RetryPolicy,
        settings: IngestSettings,
    ) -> Self {
        let permits = settings.write_concurrency.max(1);
        Self {
            store,
            extractor,
            embedder,
            linker,
            retry: RetryExecutor::new(retry),
            write_limiter: Arc::new(Semaphore::new(permits)),
            progress: Arc::new(NoopProgress),
            settings,
        }
    }

    /// Report job progress to `sink`.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Share `limiter` with other pipelines in the process.
    #[must_use]
    pub fn with_write_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.write_limiter = limiter;
        self
    }

    /// The write limiter.
    pub fn write_limiter(&self) -> &Arc<Semaphore> {
        &self.write_limiter
    }

    /// Ingest `text` into `layer`.
    pub async fn ingest_text(
        &self,
        text: &str,
        layer: Layer,
        source_description: &str,
        author: Option<UserId>,
    ) -> Result<IngestOutcome> {
        let mut request = IngestRequest::new(text, layer).source(source_description);
        request.author = author;
        self.ingest(request).await
    }

    fn report(&self, job: Option<&JobId>, update: JobUpdate) {
        if let Some(job) = job {
            self.progress.update(job, update);
        }
    }

    /// Run the pipeline.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let started = Instant::now();
        let job = request.job.as_ref();

        let text = request.text.trim();
        if text.is_empty() {
            self.report(job, JobUpdate::stage(JobStage::Error));
            count_outcome(IngestStatus::Error);
            return Ok(IngestOutcome::rejected(
                MemoryError::EmptyText.to_string(),
                started,
            ));
        }

        let document_fp = fingerprint(text);
        if request.bypasses_duplicate_check() {
            return self.write_document(&request, text, &document_fp, started).await;
        }

        let owner = ClaimId::new();
        match self.claim_or_wait(request.layer, &document_fp, &owner).await? {
            ClaimState::Claimed => {}
            ClaimState::Duplicate(existing) => {
                info!(
                    layer = %request.layer,
                    episode = %existing,
                    "duplicate content, skipping"
                );
                self.report(job, JobUpdate::stage(JobStage::Done));
                count_outcome(IngestStatus::Skipped);
                return Ok(IngestOutcome::duplicate(existing, started));
            }
            ClaimState::Busy => {
                warn!(layer = %request.layer, "same content is still being ingested elsewhere");
                self.report(job, JobUpdate::stage(JobStage::Done));
                count_outcome(IngestStatus::Skipped);
                return Ok(IngestOutcome::in_progress(started));
            }
        }

        let result = self.write_document(&request, text, &document_fp, started).await;
        if let Err(e) = self
            .store
            .release_fingerprint(request.layer, &document_fp, &owner)
            .await
        {
            warn!(layer = %request.layer, error = %e, "failed to release ingest claim");
        }
        result
    }

    /// Look for a stored duplicate and otherwise claim the fingerprint,
    /// polling while another writer holds it.
    async fn claim_or_wait(
        &self,
        layer: Layer,
        document_fp: &str,
        owner: &ClaimId,
    ) -> Result<ClaimState> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.claim_wait_ms);
        let poll = Duration::from_millis(self.settings.claim_poll_ms.max(1));
        let stale_secs = i64::try_from(self.settings.claim_stale_secs).unwrap_or(i64::MAX / 1000);

        loop {
            if let Some(existing) = self.store.find_episode_by_fingerprint(layer, document_fp).await? {
                return Ok(ClaimState::Duplicate(existing.id));
            }

            let stale_before = Utc::now()
                .checked_sub_signed(chrono::Duration::seconds(stale_secs))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            if self
                .store
                .claim_fingerprint(layer, document_fp, owner, stale_before)
                .await?
            {
                // The previous holder may have finished between the lookup and the claim.
                if let Some(existing) = self.store.find_episode_by_fingerprint(layer, document_fp).await? {
                    let _ = self.store.release_fingerprint(layer, document_fp, owner).await?;
                    return Ok(ClaimState::Duplicate(existing.id));
                }
                return Ok(ClaimState::Claimed);
            }

            if Instant::now() >= deadline {
                return Ok(ClaimState::Busy);
            }
            debug!(%layer, "fingerprint claimed by another writer, waiting");
            tokio::time::sleep(poll).await;
        }
    }

    /// Chunk, extract and stamp one document.
    async fn write_document(
        &self,
        request: &IngestRequest,
        text: &str,
        document_fp: &str,
        started: Instant,
    ) -> Result<IngestOutcome> {
        let job = request.job.as_ref();
        let chunks = split_into_chunks(
            text,
            self.settings.max_chunk_chars,
            self.settings.min_chunk_chars,
        );
        let total = chunks.len();
        debug!(total, chars = text.len(), source = %request.source_description, "ingest chunks");
        self.report(
            job,
            JobUpdate {
                stage: Some(JobStage::Ingest),
                processed: Some(0),
                total: Some(total),
                ..JobUpdate::default()
            },
        );

        let reference_time = Utc::now();
        let mut episode_ids = Vec::new();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let index = i + 1;
            let chunk_source = if total > 1 {
                format!("{} (part {index}/{total})", request.source_description)
            } else {
                request.source_description.clone()
            };
            let chunk_fp = if index == 1 {
                document_fp.to_string()
            } else {
                fingerprint(chunk)
            };
            let extraction = ExtractionRequest {
                name: truncate_chars(&chunk_source, MAX_NAME_CHARS).to_string(),
                episode_body: chunk.clone(),
                source_description: chunk_source.clone(),
                reference_time,
                group_id: request.layer.as_str().to_string(),
            };

            let written = {
                let _permit = self
                    .write_limiter
                    .acquire()
                    .await
                    .map_err(|_| MemoryError::QueueClosed)?;
                match self.write_chunk(request, &extraction, index).await? {
                    Ok(outcome) => {
                        if let Some(w) = outcome.dropped_warning(index) {
                            warnings.push(w);
                        }
                        match outcome.episode_id() {
                            Some(id) => {
                                let id = id.clone();
                                warnings.extend(self.finish_episode(request, &id, chunk, &chunk_fp, index).await);
                                Some(id)
                            }
                            None => None,
                        }
                    }
                    Err(message) => {
                        errors.push(message);
                        None
                    }
                }
            };
            if let Some(id) = written {
                episode_ids.push(id);
            }

            self.report(
                job,
                JobUpdate {
                    stage: Some(JobStage::Ingest),
                    processed: Some(index),
                    ..JobUpdate::default()
                },
            );
        }

        let added = episode_ids.len();
        let stage = JobStage::resolve(added, errors.len(), warnings.len());
        let reason = errors.first().cloned();
        warnings.extend(errors);
        let status = if added > 0 {
            IngestStatus::Success
        } else {
            IngestStatus::Error
        };
        let elapsed_secs = started.elapsed().as_secs_f64();

        self.report(
            job,
            JobUpdate {
                stage: Some(stage),
                processed: Some(added),
                total: Some(total),
                warnings: Some(warnings.clone()),
                elapsed_secs: Some(elapsed_secs),
                ..JobUpdate::default()
            },
        );
        count_outcome(status);
        info!(
            source = %request.source_description,
            layer = %request.layer,
            added,
            total,
            elapsed_secs,
            ?stage,
            "ingest finished"
        );

        Ok(IngestOutcome {
            status,
            episode_ids,
            reason: if status == IngestStatus::Error { reason } else { None },
            chunks: total,
            added,
            warnings,
            stage,
            elapsed_secs,
        })
    }

    /// Call the extraction service for one chunk.
    ///
    /// The outer `Result` carries store failures; the inner `Err` is a
    /// chunk-level error message.
    async fn write_chunk(
        &self,
        request: &IngestRequest,
        extraction: &ExtractionRequest,
        index: usize,
    ) -> Result<std::result::Result<ExtractionOutcome, String>> {
        let job = request.job.as_ref();
        let observer = |secs: f64, attempt: u32| {
            self.report(
                job,
                JobUpdate {
                    stage: Some(JobStage::RateLimited),
                    message: Some(format!(
                        "rate limited, retrying in {secs:.1}s (attempt {attempt})"
                    )),
                    retry_in_secs: Some(secs),
                    ..JobUpdate::default()
                },
            );
        };
        let op_name = format!("add_episode:{}:{index}", request.kind);

        let response = self
            .retry
            .run(&op_name, Some(&observer), || {
                self.extractor.add_episode(extraction)
            })
            .await;

        let recover_reason = match response {
            Ok(value) => {
                let outcome = ExtractionOutcome::from_response(&value);
                if outcome.episode_id().is_some() {
                    return Ok(Ok(outcome));
                }
                "response carried no episode id".to_string()
            }
            Err(e) if e.is_validation() => e.to_string(),
            Err(e) => {
                warn!(chunk = index, error = %e, "extraction failed");
                return Ok(Err(format!("chunk {index}: {e}")));
            }
        };

        let found = self
            .store
            .find_episode_by_content(
                request.layer,
                &extraction.episode_body,
                &extraction.source_description,
            )
            .await?;
        match found {
            Some(episode) => {
                info!(chunk = index, episode = %episode.id, reason = %recover_reason, "recovered episode after unreadable extraction response");
                Ok(Ok(ExtractionOutcome::recovered(episode.id)))
            }
            None => {
                warn!(chunk = index, reason = %recover_reason, "extraction response unusable and no episode found");
                let err = MemoryError::NoEpisodeId {
                    source_description: extraction.source_description.clone(),
                };
                Ok(Err(format!("chunk {index}: {err} ({recover_reason})")))
            }
        }
    }

    /// Post-write stamping for one episode. Returns warnings.
    async fn finish_episode(
        &self,
        request: &IngestRequest,
        id: &EpisodeId,
        chunk: &str,
        chunk_fp: &str,
        index: usize,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.store.set_episode_layer_if_missing(id, request.layer).await {
            warn!(episode = %id, error = %e, "failed to stamp layer");
        }
        if let Err(e) = self.store.set_episode_fingerprint(id, chunk_fp).await {
            warn!(episode = %id, error = %e, "failed to stamp fingerprint");
        }

        let mut metadata = json!({ "episode_kind": request.kind.as_str() });
        if let (Some(target), Some(extra)) = (metadata.as_object_mut(), request.metadata.as_object()) {
            for (k, v) in extra {
                let _ = target.insert(k.clone(), v.clone());
            }
        }
        if let Err(e) = self.store.update_episode_metadata(id, metadata).await {
            warn!(episode = %id, error = %e, "failed to stamp metadata");
        }

        if let Some(w) = self.enforce_embedding(id, chunk, index).await {
            warnings.push(w);
        }

        if let Some(author) = &request.author {
            if let Err(e) = self.store.attach_author(author, id).await {
                warn!(episode = %id, author = %author, error = %e, "failed to attach author");
            }
        }

        let _ = self.linker.link_episode(id).await;
        warnings
    }

    /// Compute, store and read back the episode embedding.
    async fn enforce_embedding(&self, id: &EpisodeId, chunk: &str, index: usize) -> Option<String> {
        let text = truncate_chars(chunk, self.settings.max_embedding_chars);
        let vector = match self.embedder.embed_single(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(episode = %id, error = %e, "embedding failed");
                return Some(format!("chunk {index}: embedding failed: {e}"));
            }
        };
        let dims = vector.len();
        match self.store.set_episode_embedding(id, vector).await {
            Ok(true) => {}
            Ok(false) => return Some(format!("chunk {index}: episode vanished before embedding")),
            Err(e) => return Some(format!("chunk {index}: embedding not stored: {e}")),
        }
        match self.store.get_episode_embedding(id).await {
            Ok(Some(v)) if v.len() == dims => None,
            Ok(_) => {
                warn!(episode = %id, "embedding missing after write");
                Some(format!("chunk {index}: embedding missing after write"))
            }
            Err(e) => Some(format!("chunk {index}: embedding not verified: {e}")),
        }
    }
}

fn count_outcome(status: IngestStatus) {
    metrics::counter!("ingest_episodes_total", "status" => status.as_str()).increment(1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::InMemoryJobs;
    use crate::testing::{Script, ScriptedExtractor};
    use strata_embeddings::HashEmbedder;
    use strata_settings::LinkerSettings;
    use strata_store::SqliteGraphStore;

    fn pipeline(script: Vec<Script>) -> (Arc<SqliteGraphStore>, Arc<ScriptedExtractor>, IngestionPipeline) {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let extractor = ScriptedExtractor::new(store.clone(), script);
        let linker = CrossLayerLinker::new(store.clone(), LinkerSettings::default());
        let policy = RetryPolicy {
            base_sleep_ms: 1,
            max_sleep_ms: 2,
            hint_padding_ms: 0,
            ..RetryPolicy::default()
        };
        let settings = IngestSettings {
            max_chunk_chars: 60,
            min_chunk_chars: 10,
            claim_wait_ms: 2_000,
            claim_poll_ms: 5,
            ..IngestSettings::default()
        };
        let pipeline = IngestionPipeline::new(
            store.clone(),
            extractor.clone(),
            Arc::new(HashEmbedder::new(8)),
            linker,
            policy,
            settings,
        );
        (store, extractor, pipeline)
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let (_, extractor, p) = pipeline(vec![]);
        let out = p.ingest_text("   \n", Layer::Knowledge, "notes", None).await.unwrap();
        assert_eq!(out.status, IngestStatus::Error);
        assert_eq!(out.reason.as_deref(), Some("text is empty"));
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn second_ingest_of_same_text_is_skipped() {
        let (store, extractor, p) = pipeline(vec![]);
        let first = p
            .ingest_text("Lena is a designer.", Layer::Knowledge, "notes", None)
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::Success);
        assert_eq!(first.stage, JobStage::Done);

        let second = p
            .ingest_text("  lena IS a   designer. ", Layer::Knowledge, "notes", None)
            .await
            .unwrap();
        assert_eq!(second.status, IngestStatus::Skipped);
        assert_eq!(second.reason.as_deref(), Some("duplicate"));
        assert_eq!(second.episode_id(), first.episode_id());
        assert_eq!(extractor.calls(), 1);

        // Another layer is not a duplicate.
        let other = p
            .ingest_text("Lena is a designer.", Layer::Personal, "notes", None)
            .await
            .unwrap();
        assert_eq!(other.status, IngestStatus::Success);

        let ep = store.get_episode(first.episode_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(ep.layer, Some(Layer::Knowledge));
        assert_eq!(ep.kind, Some(EpisodeKind::Document));
        assert!(store.get_episode_embedding(&ep.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_duplicates_write_one_episode() {
        let (store, extractor, p) = pipeline(vec![]);
        let text = "Lena is a designer in Riga.";
        let (a, b) = tokio::join!(
            p.ingest(IngestRequest::new(text, Layer::Knowledge)),
            p.ingest(IngestRequest::new(text, Layer::Knowledge)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut statuses = vec![a.status, b.status];
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![IngestStatus::Skipped, IngestStatus::Success]);
        assert_eq!(a.episode_id(), b.episode_id());
        assert_eq!(extractor.calls(), 1);

        let fp = fingerprint(text);
        let owner = ClaimId::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        // The winner released its claim.
        assert!(store.claim_fingerprint(Layer::Knowledge, &fp, &owner, past).await.unwrap());
    }

    #[tokio::test]
    async fn held_claim_makes_ingest_skip_without_extraction() {
        let (store, extractor, p) = pipeline(vec![]);
        let p = IngestionPipeline {
            settings: IngestSettings {
                claim_wait_ms: 20,
                ..p.settings.clone()
            },
            ..p
        };
        let text = "Mark leads the studio.";
        let holder = ClaimId::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store
            .claim_fingerprint(Layer::Project, &fingerprint(text), &holder, past)
            .await
            .unwrap());

        let out = p.ingest_text(text, Layer::Project, "notes", None).await.unwrap();
        assert_eq!(out.status, IngestStatus::Skipped);
        assert_eq!(out.reason.as_deref(), Some("in_progress"));
        assert!(out.episode_ids.is_empty());
        assert_eq!(extractor.calls(), 0);

        // Once the holder lets go the text goes through.
        assert!(store
            .release_fingerprint(Layer::Project, &fingerprint(text), &holder)
            .await
            .unwrap());
        let out = p.ingest_text(text, Layer::Project, "notes", None).await.unwrap();
        assert_eq!(out.status, IngestStatus::Success);
    }

    #[tokio::test]
    async fn failed_write_releases_claim() {
        let (_, extractor, p) = pipeline(vec![Script::Fail]);
        let text = "Lena is a designer.";
        let first = p.ingest_text(text, Layer::Knowledge, "notes", None).await.unwrap();
        assert_eq!(first.status, IngestStatus::Error);
        let second = p.ingest_text(text, Layer::Knowledge, "notes", None).await.unwrap();
        assert_eq!(second.status, IngestStatus::Success);
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn long_text_is_chunked_with_part_labels() {
        let (store, _, p) = pipeline(vec![]);
        let text = "First paragraph about Lena and her design work.\n\n\
                    Second paragraph about the studio in Riga.\n\n\
                    Third paragraph about the clients she serves.";
        let out = p.ingest_text(text, Layer::Knowledge, "doc", None).await.unwrap();
        assert!(out.chunks > 1);
        assert_eq!(out.added, out.chunks);

        let last = store
            .get_episode(out.episode_ids.last().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            last.source_description,
            format!("doc (part {}/{})", out.chunks, out.chunks)
        );

        let again = p.ingest_text(text, Layer::Knowledge, "doc", None).await.unwrap();
        assert_eq!(again.status, IngestStatus::Skipped);
        assert_eq!(again.episode_id(), out.episode_id());
    }

    #[tokio::test]
    async fn rate_limits_are_retried_and_reported() {
        let (_, extractor, p) = pipeline(vec![Script::RateLimited, Script::RateLimited]);
        let jobs = InMemoryJobs::new();
        let p = p.with_progress(Arc::new(jobs.clone()));
        let job = jobs.create();

        let out = p
            .ingest(IngestRequest::new("Lena is a designer.", Layer::Knowledge).job(job.clone()))
            .await
            .unwrap();
        assert_eq!(out.status, IngestStatus::Success);
        assert_eq!(extractor.calls(), 3);

        let record = jobs.get(&job).unwrap();
        assert_eq!(record.stage, JobStage::Done);
        assert_eq!(record.processed, 1);
        assert!(record.retry_in_secs.is_none());
        assert!(record.message.unwrap().contains("attempt 2"));
    }

    #[tokio::test]
    async fn validation_error_recovers_written_episode() {
        let (store, _, p) = pipeline(vec![Script::WriteThenValidation]);
        let out = p
            .ingest_text("Lena is a designer.", Layer::Knowledge, "notes", None)
            .await
            .unwrap();
        assert_eq!(out.status, IngestStatus::Success);
        let ep = store.get_episode(out.episode_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(ep.content, "Lena is a designer.");
        assert_eq!(ep.layer, Some(Layer::Knowledge));
    }

    #[tokio::test]
    async fn id_less_response_recovers_too() {
        let (_, _, p) = pipeline(vec![Script::WriteNoId]);
        let out = p
            .ingest_text("Mark leads the studio.", Layer::Project, "notes", None)
            .await
            .unwrap();
        assert_eq!(out.status, IngestStatus::Success);
        assert_eq!(out.stage, JobStage::Done);
    }

    #[tokio::test]
    async fn hard_failure_reports_error() {
        let (_, _, p) = pipeline(vec![Script::Fail]);
        let out = p
            .ingest_text("Lena is a designer.", Layer::Knowledge, "notes", None)
            .await
            .unwrap();
        assert_eq!(out.status, IngestStatus::Error);
        assert_eq!(out.stage, JobStage::Error);
        assert!(out.reason.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn partial_failure_is_done_with_warnings() {
        let (_, _, p) = pipeline(vec![Script::Ok, Script::Fail]);
        let text = "First paragraph about Lena and her design work.\n\n\
                    Second paragraph about the studio in Riga.";
        let out = p.ingest_text(text, Layer::Knowledge, "doc", None).await.unwrap();
        assert_eq!(out.chunks, 2);
        assert_eq!(out.added, 1);
        assert_eq!(out.status, IngestStatus::Success);
        assert_eq!(out.stage, JobStage::DoneWithWarnings);
        assert!(out.reason.is_none());
        assert!(out.warnings.iter().any(|w| w.starts_with("chunk 2:")));
    }

    #[tokio::test]
    async fn author_and_metadata_are_attached() {
        let (store, _, p) = pipeline(vec![]);
        let user = UserId::from("u1");
        let out = p
            .ingest(
                IngestRequest::new("User: hi\nAssistant: hello", Layer::Personal)
                    .source("chat")
                    .author(user.clone())
                    .kind(EpisodeKind::ChatTurn)
                    .metadata(json!({"conversation_id": "c1", "turn_index": 1})),
            )
            .await
            .unwrap();
        let ep = store.get_episode(out.episode_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(ep.author, Some(user));
        assert_eq!(ep.kind, Some(EpisodeKind::ChatTurn));
        assert_eq!(ep.turn_index, Some(1));
    }

    #[tokio::test]
    async fn chat_turns_bypass_duplicate_check() {
        let (_, extractor, p) = pipeline(vec![]);
        for _ in 0..2 {
            let out = p
                .ingest(
                    IngestRequest::new("User: ok\nAssistant: ok", Layer::Personal)
                        .kind(EpisodeKind::ChatTurn),
                )
                .await
                .unwrap();
            assert_eq!(out.status, IngestStatus::Success);
        }
        assert_eq!(extractor.calls(), 2);
    }
}
