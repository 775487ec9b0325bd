//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`StrataSettings::default()`]
//! 2. If `~/.strata/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{LogLevelSetting, StrataSettings, data_dir};

/// Resolve the path to the settings file (`~/.strata/settings.json`).
pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<StrataSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an inconsistent
/// combination of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<StrataSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// [`load_settings_from_path`] with an injectable environment lookup.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<StrataSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(StrataSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: StrataSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, &Env(env));
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject combinations that would make the engine misbehave.
pub fn validate(settings: &StrataSettings) -> Result<()> {
    let ingest = &settings.ingest;
    if ingest.write_concurrency == 0 {
        return Err(SettingsError::InvalidValue(
            "ingest.writeConcurrency must be at least 1".into(),
        ));
    }
    if ingest.max_chunk_chars == 0 || ingest.min_chunk_chars > ingest.max_chunk_chars {
        return Err(SettingsError::InvalidValue(format!(
            "ingest.minChunkChars ({}) must not exceed ingest.maxChunkChars ({})",
            ingest.min_chunk_chars, ingest.max_chunk_chars
        )));
    }
    if settings.retry.max_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "retry.maxAttempts must be at least 1".into(),
        ));
    }
    if !(0.0..=1.0).contains(&settings.retry.jitter_fraction) {
        return Err(SettingsError::InvalidValue(
            "retry.jitterFraction must be within 0..=1".into(),
        ));
    }
    if settings.cache.max_entries == 0 {
        return Err(SettingsError::InvalidValue(
            "cache.maxEntries must be at least 1".into(),
        ));
    }
    let conv = &settings.conversation;
    if conv.summary_interval <= 0 || conv.queue_workers == 0 || conv.queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "conversation.summaryInterval, queueWorkers and queueCapacity must be positive"
                .into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
fn apply_env_overrides<F>(settings: &mut StrataSettings, env: &Env<F>)
where
    F: Fn(&str) -> Option<String>,
{
    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("STRATA_LOG_LEVEL") {
        settings.log_level = LogLevelSetting(v);
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("STRATA_DB") {
        settings.store.path = PathBuf::from(v);
    }
    if let Some(v) = env.u64("STRATA_POOL_SIZE", 1, 64) {
        settings.store.pool_size = u32::try_from(v).unwrap_or(settings.store.pool_size);
    }

    // ── Ingest ──────────────────────────────────────────────────────
    if let Some(v) = env.usize("STRATA_WRITE_CONCURRENCY", 1, 64) {
        settings.ingest.write_concurrency = v;
    }
    if let Some(v) = env.usize("MAX_CHAT_TURN_CHARS", 100, 1_000_000) {
        settings.ingest.long_message_chars = v;
    }
    if let Some(v) = env.usize("MAX_EMBEDDING_CHARS", 100, 1_000_000) {
        settings.ingest.max_embedding_chars = v;
    }

    // ── Retry ───────────────────────────────────────────────────────
    if let Some(v) = env.u64("RATE_LIMIT_MAX_ATTEMPTS", 1, 100) {
        settings.retry.max_attempts = u32::try_from(v).unwrap_or(settings.retry.max_attempts);
    }
    if let Some(v) = env.u64("RATE_LIMIT_BASE_SLEEP_MS", 1, 600_000) {
        settings.retry.base_sleep_ms = v;
    }

    // ── Cache ───────────────────────────────────────────────────────
    if let Some(v) = env.usize("EMBEDDING_CACHE_MAX_SIZE", 1, 10_000_000) {
        settings.cache.max_entries = v;
    }
    if let Some(v) = env.u64("EMBEDDING_CACHE_TTL_HOURS", 1, 87_600) {
        settings.cache.ttl_hours = v;
    }
    if let Some(v) = env.string("STRATA_CACHE_PATH") {
        settings.cache.path = Some(PathBuf::from(v));
    }

    // ── Retrieval / context ─────────────────────────────────────────
    if let Some(v) = env.bool("STRATA_SECOND_HOP") {
        settings.retrieval.second_hop_enabled = v;
    }
    if let Some(v) = env.usize("MAX_CONTEXT_TOKENS", 100, 1_000_000) {
        settings.context.max_tokens = v;
    }

    // ── Provider / extraction ───────────────────────────────────────
    if let Some(v) = env.string("OPENAI_API_KEY") {
        settings.provider.api_key = Some(v);
    }
    if let Some(v) = env.string("OPENAI_BASE_URL") {
        settings.provider.base_url = v;
    }
    if let Some(v) = env.string("OPENAI_MODEL") {
        settings.provider.chat_model = v;
    }
    if let Some(v) = env.string("EMBEDDING_MODEL") {
        settings.provider.embedding_model = v;
    }
    if let Some(v) = env.string("STRATA_EXTRACTION_URL") {
        settings.extraction.base_url = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.0)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.0)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.0)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
