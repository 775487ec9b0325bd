//! Provider error taxonomy.
//!
//! Two classes drive control flow elsewhere: [`ProviderError::RateLimited`]
//! is retried by [`retry_rate_limited`](crate::retry::retry_rate_limited),
//! and [`ProviderError::Validation`] lets ingestion attempt recovery from
//! the store. Everything else propagates unchanged.

use thiserror::Error;

/// Errors from the embedding/chat provider and the extraction service.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service asked us to slow down.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Server message (may carry a "try again in" hint).
        message: String,
        /// Parsed `Retry-After` header, if any.
        retry_after_ms: Option<u64>,
    },

    /// The service's own output failed its schema.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success API response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Extracted message.
        message: String,
    },

    /// A success response we could not decode.
    #[error("parse error: {0}")]
    Parse(String),

    /// The call exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Retrying was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether this is a rate-limit failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether this is a validation-shaped failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Server-suggested wait, if the error carried one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Metric label for the error.
    pub fn category(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limit",
            Self::Validation(_) => "validation",
            Self::Http(_) => "network",
            Self::Api { .. } => "api",
            Self::Parse(_) => "parse",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result alias for provider calls.
pub type Result<T> = std::result::Result<T, ProviderError>;
