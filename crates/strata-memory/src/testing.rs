//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use strata_core::{EpisodeId, Layer};
use strata_llm::{ChatMessage, ChatProvider, ExtractionRequest, ProviderError};
use strata_store::{GraphStore, NewEntity, NewEpisode, SqliteGraphStore};

use crate::extraction::ExtractionService;

/// One scripted extraction response.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Script {
    Ok,
    RateLimited,
    /// Writes the episode, then reports a validation error.
    WriteThenValidation,
    /// Fails without writing.
    Fail,
    /// Writes, then answers with an id-less body.
    WriteNoId,
}

/// Extraction service that writes into the store itself.
///
/// Capitalized words of three or more letters become entities in the
/// request's layer, mentioned by the episode. The episode layer is left
/// unset so the pipeline's stamping is exercised.
pub(crate) struct ScriptedExtractor {
    store: Arc<SqliteGraphStore>,
    calls: AtomicUsize,
    script: Mutex<Vec<Script>>,
}

impl ScriptedExtractor {
    pub(crate) fn new(store: Arc<SqliteGraphStore>, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            store,
            calls: AtomicUsize::new(0),
            script: Mutex::new(script),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn write(&self, req: &ExtractionRequest) -> EpisodeId {
        let mut ep = NewEpisode::new(req.name.clone(), req.episode_body.clone());
        ep.source_description = req.source_description.clone();
        let episode = self.store.insert_episode(ep).await.unwrap();

        let layer: Layer = req.group_id.parse().unwrap();
        for word in req.episode_body.split(|c: char| !c.is_alphanumeric()) {
            let capitalized = word.chars().next().is_some_and(char::is_uppercase);
            if capitalized && word.chars().count() >= 3 && word != "User" && word != "Assistant" {
                let entity = self
                    .store
                    .upsert_entity(NewEntity {
                        name: word.to_string(),
                        layer,
                        summary: String::new(),
                        tags: vec![],
                    })
                    .await
                    .unwrap();
                self.store.mention(&episode.id, &entity.id).await.unwrap();
            }
        }
        episode.id
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtractor {
    async fn add_episode(&self, req: &ExtractionRequest) -> strata_llm::Result<Value> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock();
            if script.is_empty() {
                Script::Ok
            } else {
                script.remove(0)
            }
        };
        match step {
            Script::Ok => {
                let id = self.write(req).await;
                Ok(json!({"episode": {"uuid": id.as_str()}, "nodes": [], "edges": []}))
            }
            Script::RateLimited => Err(ProviderError::RateLimited {
                message: "Please try again in 1ms".into(),
                retry_after_ms: None,
            }),
            Script::WriteThenValidation => {
                let _ = self.write(req).await;
                Err(ProviderError::Validation("entity schema".into()))
            }
            Script::Fail => Err(ProviderError::Api {
                status: 500,
                message: "down".into(),
            }),
            Script::WriteNoId => {
                let _ = self.write(req).await;
                Ok(json!({"status": "queued"}))
            }
        }
    }
}

/// Chat provider answering with a fixed reply, or failing.
pub(crate) struct FixedChat {
    pub(crate) reply: Option<String>,
    pub(crate) prompts: Mutex<Vec<String>>,
}

impl FixedChat {
    pub(crate) fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChatProvider for FixedChat {
    async fn chat(&self, messages: &[ChatMessage]) -> strata_llm::Result<String> {
        self.prompts
            .lock()
            .extend(messages.iter().map(|m| m.content.clone()));
        self.reply
            .clone()
            .ok_or_else(|| ProviderError::Api {
                status: 503,
                message: "unavailable".into(),
            })
    }
}
