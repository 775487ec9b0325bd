//! Retry policy and backoff calculation.
//!
//! The async retry loop lives in `strata-llm`; this module holds the
//! portable, sync-only building blocks:
//!
//! - [`RetryPolicy`]: attempt cap, backoff base and cap, jitter
//! - [`RetryPolicy::backoff_ms`]: capped exponential backoff
//! - [`RetryPolicy::sleep_ms`]: final sleep including hint and jitter
//! - [`parse_retry_hint_ms`]: server-suggested wait parsed from an error message

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum attempts (including the first call).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;
/// Default base sleep in milliseconds.
pub const DEFAULT_BASE_SLEEP_MS: u64 = 2000;
/// Default sleep cap in milliseconds.
pub const DEFAULT_MAX_SLEEP_MS: u64 = 30_000;
/// Default jitter fraction; up to this share of the sleep is added on top.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;
/// Padding added to a server-suggested wait.
pub const DEFAULT_HINT_PADDING_MS: u64 = 500;

/// Retry parameters for rate-limited calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first call included.
    pub max_attempts: u32,
    /// Base sleep for exponential backoff.
    pub base_sleep_ms: u64,
    /// Upper bound for computed backoff (hints are not capped).
    pub max_sleep_ms: u64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter_fraction: f64,
    /// Padding added on top of a parsed server hint.
    pub hint_padding_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_sleep_ms: DEFAULT_BASE_SLEEP_MS,
            max_sleep_ms: DEFAULT_MAX_SLEEP_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            hint_padding_ms: DEFAULT_HINT_PADDING_MS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

impl RetryPolicy {
    /// Exponential backoff for a 1-based `attempt`: `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_sleep_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_sleep_ms)
    }

    /// Sleep before retrying after the given failed `attempt`.
    ///
    /// Uses the server hint (plus padding) when present, else
    /// [`backoff_ms`](Self::backoff_ms). Then adds `random * jitter_fraction`
    /// of the sleep, where `random` is in `[0, 1)`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn sleep_ms(&self, attempt: u32, hint_ms: Option<u64>, random: f64) -> u64 {
        let base = match hint_ms {
            Some(hint) => hint.saturating_add(self.hint_padding_ms),
            None => self.backoff_ms(attempt),
        };
        let jitter = (base as f64) * self.jitter_fraction * random.clamp(0.0, 1.0);
        base.saturating_add(jitter.round() as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hint parsing
// ─────────────────────────────────────────────────────────────────────────────

static RETRY_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)\s*(ms|s)\b").unwrap());

/// Parse a suggested wait such as `"Please try again in 1.5s"` or
/// `"try again in 250ms"` out of an error message.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_retry_hint_ms(message: &str) -> Option<u64> {
    let caps = RETRY_HINT.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    let ms = if unit == "ms" { value } else { value * 1000.0 };
    Some(ms.round().max(0.0) as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
