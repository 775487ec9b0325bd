//! Error response parsing shared by the HTTP clients.
//!
//! Handles the common envelope shapes:
//! - Standard: `{"error": {"message": "...", "type": "..."}}`
//! - Detail:   `{"detail": "..."}` (FastAPI services)
//! - Flat:     `{"message": "...", "code": "..."}`

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

use crate::errors::ProviderError;

/// Extract a human-readable message from an error body.
pub fn parse_error_message(body: &str, status: u16) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json["error"]["message"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = json["detail"].as_str().or_else(|| json["message"].as_str()) {
            return msg.to_string();
        }
        // FastAPI validation errors carry a list under "detail".
        if let Some(first) = json["detail"].as_array().and_then(|a| a.first()) {
            if let Some(msg) = first["msg"].as_str() {
                return msg.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    }
}

/// Parse a `Retry-After` header given in whole or fractional seconds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_retry_after_header(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

/// Map a non-success response onto the error taxonomy.
///
/// 429 becomes [`ProviderError::RateLimited`], 422 becomes
/// [`ProviderError::Validation`], everything else [`ProviderError::Api`].
pub fn classify_response(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let message = parse_error_message(body, status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message,
            retry_after_ms: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_header),
        },
        StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Validation(message),
        _ => ProviderError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
