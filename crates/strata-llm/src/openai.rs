//! OpenAI-compatible HTTP client: embeddings and chat completions.
//!
//! Both endpoints go through the [`RetryExecutor`], so rate limits are
//! absorbed here and callers only see terminal failures.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_core::RetryPolicy;
use strata_embeddings::{EmbeddingError, EmbeddingProvider};
use strata_settings::ProviderSettings;
use tracing::{debug, info};

use crate::error_parsing::classify_response;
use crate::errors::{ProviderError, Result};
use crate::retry::RetryExecutor;

// ─────────────────────────────────────────────────────────────────────────────
// Chat types
// ─────────────────────────────────────────────────────────────────────────────

/// Chat message author.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions.
    System,
    /// End user.
    User,
    /// Model output.
    Assistant,
}

/// One chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: ChatRole,
    /// Text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Earlier assistant reply.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text generation from a message list.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Generate a reply.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Client configuration.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API base URL, without trailing slash.
    pub base_url: String,
    /// Bearer token.
    pub api_key: Option<String>,
    /// Embedding model.
    pub embedding_model: String,
    /// Chat model.
    pub chat_model: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl OpenAiConfig {
    /// Config from the provider settings section.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            embedding_model: settings.embedding_model.clone(),
            chat_model: settings.chat_model.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

/// OpenAI-compatible embeddings and chat client.
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: reqwest::Client,
    retry: RetryExecutor,
}

impl OpenAiClient {
    /// Build a client with its own connection pool.
    pub fn new(config: OpenAiConfig, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        info!(
            base_url = %config.base_url,
            embedding_model = %config.embedding_model,
            chat_model = %config.chat_model,
            "provider client initialized"
        );
        Ok(Self {
            config,
            client,
            retry: RetryExecutor::new(retry),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    async fn post_json<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{path}", self.config.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &headers, &body_text));
        }
        let text = response.text().await.map_err(map_transport)?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// Embed a batch, retrying rate limits.
    pub async fn create_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        let response: EmbeddingResponse = self
            .retry
            .run("embeddings", None, || self.post_json("/embeddings", &request))
            .await?;

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(ProviderError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        debug!(count = data.len(), "embeddings created");
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            temperature: 0.2,
        };
        let response: ChatResponse = self
            .retry
            .run("chat", None, || self.post_json("/chat/completions", &request))
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Parse("no choices in chat response".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> strata_embeddings::Result<Vec<Vec<f32>>> {
        self.create_embeddings(texts)
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))
    }

    fn model(&self) -> &str {
        &self.config.embedding_model
    }
}

/// Timeouts get their own variant; everything else stays a transport error.
pub(crate) fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Http(err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
