//! # strata-llm
//!
//! Calls to rate-limited external services.
//!
//! - [`RetryExecutor`]: rate-limit retry with hint parsing, backoff and jitter
//! - [`ProviderError`]: failure taxonomy shared by every client
//! - [`OpenAiClient`]: embeddings and chat completions
//! - [`HttpExtractionClient`]: the knowledge extraction service

#![deny(unsafe_code)]

pub mod error_parsing;
pub mod errors;
pub mod extraction;
pub mod openai;
pub mod retry;

pub use errors::{ProviderError, Result};
pub use extraction::{ExtractionRequest, HttpExtractionClient};
pub use openai::{ChatMessage, ChatProvider, ChatRole, OpenAiClient, OpenAiConfig};
pub use retry::{RetryExecutor, RetryObserver, retry_rate_limited};
