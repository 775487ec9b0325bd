//! End-to-end: ingestion idempotence, cross-layer bridging and expanded
//! retrieval against a file-backed store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use strata_core::{EntityId, Layer};
use strata_embeddings::HashEmbedder;
use strata_llm::ExtractionRequest;
use strata_memory::{
    EngineParts, ExtractionService, IngestRequest, IngestStatus, JobStage, MemoryEngine,
    SearchQuery,
};
use strata_settings::{CacheSettings, StrataSettings};
use strata_store::{ConnectionConfig, GraphStore, NewEntity, NewEpisode, NewFact, SqliteGraphStore};

const PRONOUNS: &[&str] = &["She", "He", "They", "It"];

/// Writes what a real extraction service would: the episode, capitalized
/// names as entities, and `X is a Y` sentences as facts.
struct SentenceExtractor {
    store: Arc<SqliteGraphStore>,
}

impl SentenceExtractor {
    async fn entity(&self, name: &str, layer: Layer) -> EntityId {
        self.store
            .upsert_entity(NewEntity {
                name: name.to_string(),
                layer,
                summary: String::new(),
                tags: vec![],
            })
            .await
            .unwrap()
            .id
    }
}

#[async_trait]
impl ExtractionService for SentenceExtractor {
    async fn add_episode(&self, req: &ExtractionRequest) -> strata_llm::Result<Value> {
        let layer: Layer = req.group_id.parse().unwrap();
        let mut episode = NewEpisode::new(req.name.clone(), req.episode_body.clone());
        episode.source_description = req.source_description.clone();
        episode.valid_at = req.reference_time;
        let episode = self.store.insert_episode(episode).await.unwrap();

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for sentence in req.episode_body.split('.') {
            let words: Vec<&str> = sentence.split_whitespace().collect();
            for word in &words {
                let capitalized = word.chars().next().is_some_and(char::is_uppercase);
                if capitalized && !PRONOUNS.contains(word) {
                    let id = self.entity(word, layer).await;
                    self.store.mention(&episode.id, &id).await.unwrap();
                    nodes.push(json!({"uuid": id.as_str(), "name": word}));
                }
            }
            if let [subject, "is", "a", object, ..] = words.as_slice() {
                let source = self.entity(subject, layer).await;
                let target = self.entity(object, layer).await;
                let fact = self
                    .store
                    .insert_fact(NewFact {
                        layer,
                        source: source.clone(),
                        target: target.clone(),
                        relation: "is_a".into(),
                        fact: sentence.trim().to_string(),
                        valid_at: Some(req.reference_time),
                        episode: Some(episode.id.clone()),
                    })
                    .await
                    .unwrap();
                edges.push(json!({
                    "uuid": fact.id.as_str(),
                    "source_node_uuid": source.as_str(),
                    "target_node_uuid": target.as_str(),
                    "name": "is_a",
                    "fact": fact.fact,
                }));
            }
        }
        Ok(json!({"episode": {"uuid": episode.id.as_str()}, "nodes": nodes, "edges": edges}))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteGraphStore>,
    engine: MemoryEngine,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteGraphStore::open(&dir.path().join("memory.db"), &ConnectionConfig::default())
            .unwrap(),
    );
    let settings = StrataSettings {
        cache: CacheSettings {
            path: Some(dir.path().join("embedding_cache.json")),
            ..CacheSettings::default()
        },
        ..StrataSettings::default()
    };
    let engine = MemoryEngine::new(
        settings,
        EngineParts {
            store: store.clone(),
            extractor: Arc::new(SentenceExtractor {
                store: store.clone(),
            }),
            embedder: Arc::new(HashEmbedder::new(16)),
            chat: None,
        },
    );
    Harness {
        _dir: dir,
        store,
        engine,
    }
}

#[tokio::test]
async fn lena_is_bridged_and_found_across_layers() {
    let h = harness();

    let first = h
        .engine
        .ingest(IngestRequest::new(
            "Lena is a designer. She has worked for 3 years.",
            Layer::Knowledge,
        ))
        .await
        .unwrap();
    assert_eq!(first.status, IngestStatus::Success);
    assert_eq!(first.stage, JobStage::Done);

    let duplicate = h
        .engine
        .ingest(IngestRequest::new(
            "  lena is a   designer.  she has worked for 3 years. ",
            Layer::Knowledge,
        ))
        .await
        .unwrap();
    assert_eq!(duplicate.status, IngestStatus::Skipped);
    assert_eq!(duplicate.episode_id(), first.episode_id());

    let personal = h
        .engine
        .ingest(IngestRequest::new("Lena", Layer::Personal))
        .await
        .unwrap();
    assert_eq!(personal.status, IngestStatus::Success);
    assert_eq!(h.store.count_bridges().await.unwrap(), 1);

    // A second mention in either layer does not add a bridge.
    let _ = h
        .engine
        .ingest(IngestRequest::new("Lena called me yesterday.", Layer::Personal))
        .await
        .unwrap();
    assert_eq!(h.store.count_bridges().await.unwrap(), 1);

    let result = h
        .engine
        .search(&SearchQuery::new("Lena", 10).layers([Layer::Personal]))
        .await
        .unwrap();
    assert!(result.entities.iter().any(|e| !e.expanded && e.item.layer == Layer::Personal));
    let knowledge_lena = result
        .entities
        .iter()
        .find(|e| e.item.layer == Layer::Knowledge)
        .unwrap();
    assert!(knowledge_lena.expanded);
    assert_eq!(knowledge_lena.hop, 1);

    let fact = result
        .relationships
        .iter()
        .find(|f| f.item.fact == "Lena is a designer")
        .unwrap();
    assert!(fact.expanded);
    assert_eq!(fact.hop, 1);
    assert_eq!(fact.item.layer, Layer::Knowledge);

    let ctx = h
        .engine
        .build_context("Lena", &[Layer::Personal], 4000)
        .await
        .unwrap();
    assert!(ctx.text.contains("- Lena called me yesterday."));
    assert!(ctx.text.contains("- Lena — is_a → designer"));
    assert!(!ctx.truncated);

    let tiny = h
        .engine
        .build_context("Lena", &[Layer::Personal], 5)
        .await
        .unwrap();
    assert!(tiny.truncated);
    assert!(tiny.text.ends_with("[context truncated to fit token budget]"));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn backfill_and_dedupe_repair_a_legacy_graph() {
    let h = harness();
    // Entities written before linking existed: no keys, no bridges.
    for (name, layer) in [
        ("Café Nord", Layer::Project),
        ("Cafe Nord", Layer::Knowledge),
        ("cafe  nord", Layer::Knowledge),
        ("Data", Layer::Project),
    ] {
        let _ = h
            .store
            .upsert_entity(NewEntity {
                name: name.into(),
                layer,
                summary: format!("{name} summary"),
                tags: vec![],
            })
            .await
            .unwrap();
    }

    let backfill = h.engine.linker().backfill_bridges(2, false).await.unwrap();
    assert_eq!(backfill.scanned, 4);
    assert_eq!(backfill.skipped, 1);
    assert!(backfill.bridges_created >= 1);

    let dry = h.engine.linker().dedupe_entities(2, true).await.unwrap();
    assert_eq!(dry.duplicates_found, 1);
    assert_eq!(dry.entities_merged, 0);

    let merged = h.engine.linker().dedupe_entities(2, false).await.unwrap();
    assert_eq!(merged.entities_merged, 1);

    let again = h.engine.linker().dedupe_entities(2, false).await.unwrap();
    assert_eq!(again.duplicates_found, 0);
}
