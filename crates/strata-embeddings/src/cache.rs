//! Bounded, time-limited embedding cache with a JSON snapshot on disk.
//!
//! - Capacity: inserting past `max_entries` evicts the least recently
//!   touched entry (both `get` hits and `set` count as a touch).
//! - TTL: entries older than `ttl` read as misses and are dropped on access.
//! - Persistence: the snapshot is loaded on first use and rewritten every
//!   `flush_every` inserts and on [`EmbeddingCache::save`]. Snapshot I/O
//!   failures are logged and the cache keeps working in memory.
//!
//! All state sits behind one mutex, so the cache can be shared freely
//! between tasks of one process. Flushes copy the entries under that mutex
//! and encode and write outside it; [`EmbeddingCache::insert`] and
//! [`EmbeddingCache::save_async`] do the write on the blocking pool.
//! Snapshots carry a generation so an older one never replaces a newer
//! one on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_settings::CacheSettings;
use tracing::{debug, info, warn};

use crate::errors::Result;

/// Source of the current time. Replaced in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cache sizing and persistence.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Entry lifetime. Zero disables expiry.
    pub ttl: Duration,
    /// Flush after this many inserts. Zero flushes only on `save`.
    pub flush_every: usize,
    /// Snapshot file; `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    /// Build from the `cache` settings section.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            ttl: Duration::hours(i64::try_from(settings.ttl_hours).unwrap_or(i64::MAX / 3600)),
            flush_every: settings.flush_every,
            path: settings.path.clone(),
        }
    }

    /// Memory-only cache.
    pub fn in_memory(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            flush_every: 0,
            path: None,
        }
    }
}

/// Cache counters for observability.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Live entries (expired ones not yet purged included).
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lookups that returned a vector.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup.
    pub hit_rate: f64,
    /// Configured TTL in hours.
    pub ttl_hours: i64,
}

struct Entry {
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
    touched: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    tick: u64,
    loaded: bool,
    pending_writes: usize,
    generation: u64,
    hits: u64,
    misses: u64,
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Snapshot record as written.
#[derive(Serialize)]
struct StoredRecord {
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
}

/// Entries copied out of the cache for one flush.
struct Snapshot {
    path: PathBuf,
    generation: u64,
    records: BTreeMap<String, StoredRecord>,
}

/// Snapshot record as read. Older snapshots stored a bare vector, or a
/// record whose timestamp was epoch seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Record {
        embedding: Vec<f32>,
        #[serde(default)]
        created_at: Option<StoredTime>,
    },
    Bare(Vec<f32>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTime {
    Iso(DateTime<Utc>),
    Epoch(f64),
}

impl StoredTime {
    #[allow(clippy::cast_possible_truncation)]
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Iso(at) => Some(at),
            Self::Epoch(secs) => Utc.timestamp_millis_opt((secs * 1000.0) as i64).single(),
        }
    }
}

/// The embedding cache. Share it behind an `Arc`.
pub struct EmbeddingCache {
    config: CacheConfig,
    clock: Clock,
    state: Mutex<State>,
    /// Generation of the snapshot last written. Held for the whole write.
    written: Arc<Mutex<u64>>,
}

impl EmbeddingCache {
    /// Create a cache. Nothing is read from disk until first use.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(Utc::now),
            state: Mutex::new(State::default()),
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Cached vector for `key`, or `None` on a miss or an expired entry.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);

        let Some(created_at) = state.entries.get(key).map(|entry| entry.created_at) else {
            record_miss(&mut state);
            return None;
        };
        if self.is_expired(created_at, now) {
            let _ = state.entries.remove(key);
            record_miss(&mut state);
            return None;
        }

        let tick = state.next_tick();
        state.hits += 1;
        metrics::counter!("embedding_cache_hits_total").increment(1);
        state.entries.get_mut(key).map(|entry| {
            entry.touched = tick;
            entry.embedding.clone()
        })
    }

    /// Insert or replace a vector, evicting the least recently touched
    /// entries beyond capacity. A due flush is written on this thread.
    pub fn set(&self, key: impl Into<String>, embedding: Vec<f32>) {
        if let Some(snapshot) = self.store_entry(key.into(), embedding) {
            if let Err(e) = write_snapshot(&snapshot, &self.written) {
                warn!(error = %e, "embedding cache flush failed; continuing in memory");
            }
        }
    }

    /// [`set`](Self::set) for async callers: a due flush is written on the
    /// blocking pool, so neither the runtime nor other cache users wait on it.
    pub async fn insert(&self, key: impl Into<String>, embedding: Vec<f32>) {
        let Some(snapshot) = self.store_entry(key.into(), embedding) else {
            return;
        };
        if let Err(e) = self.write_in_background(snapshot).await {
            warn!(error = %e, "embedding cache flush failed; continuing in memory");
        }
    }

    /// Write the snapshot now.
    pub fn save(&self) -> Result<()> {
        match self.take_snapshot_loaded() {
            Some(snapshot) => write_snapshot(&snapshot, &self.written),
            None => Ok(()),
        }
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_async(&self) -> Result<()> {
        match self.take_snapshot_loaded() {
            Some(snapshot) => self.write_in_background(snapshot).await,
            None => Ok(()),
        }
    }

    fn store_entry(&self, key: String, embedding: Vec<f32>) -> Option<Snapshot> {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);

        let tick = state.next_tick();
        let _ = state.entries.insert(
            key,
            Entry {
                embedding,
                created_at: now,
                touched: tick,
            },
        );
        evict_to(&mut state, self.config.max_entries);

        state.pending_writes += 1;
        if self.config.flush_every > 0 && state.pending_writes >= self.config.flush_every {
            self.take_snapshot(&mut state)
        } else {
            None
        }
    }

    fn take_snapshot_loaded(&self) -> Option<Snapshot> {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);
        self.take_snapshot(&mut state)
    }

    async fn write_in_background(&self, snapshot: Snapshot) -> Result<()> {
        let written = Arc::clone(&self.written);
        tokio::task::spawn_blocking(move || write_snapshot(&snapshot, &written)).await?
    }

    /// Drop every entry, reset counters and persist the empty cache.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        state.loaded = true;
        info!("embedding cache cleared");
        let snapshot = self.take_snapshot(&mut state);
        drop(state);
        match snapshot {
            Some(snapshot) => write_snapshot(&snapshot, &self.written),
            None => Ok(()),
        }
    }

    /// Purge expired entries now. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);
        let before = state.entries.len();
        let ttl_active = self.ttl_active();
        let ttl = self.config.ttl;
        state
            .entries
            .retain(|_, entry| !ttl_active || now - entry.created_at <= ttl);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "purged expired embeddings");
        }
        removed
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);
        let lookups = state.hits + state.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        };
        CacheStats {
            size: state.entries.len(),
            max_size: self.config.max_entries,
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            ttl_hours: self.config.ttl.num_hours(),
        }
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        let now = (self.clock)();
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state, now);
        state.entries.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ttl_active(&self) -> bool {
        self.config.ttl > Duration::zero()
    }

    fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.ttl_active() && now - created_at > self.config.ttl
    }

    fn ensure_loaded(&self, state: &mut State, now: DateTime<Utc>) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        let Some(path) = self.config.path.as_deref() else {
            return;
        };
        match read_snapshot(path) {
            Ok(Some(raw)) => self.restore(state, raw, now),
            Ok(None) => debug!(path = %path.display(), "no embedding cache snapshot yet"),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "failed to load embedding cache; starting empty"
            ),
        }
    }

    fn restore(&self, state: &mut State, raw: HashMap<String, StoredEntry>, now: DateTime<Utc>) {
        let mut records: Vec<(String, Vec<f32>, DateTime<Utc>)> = raw
            .into_iter()
            .map(|(key, stored)| match stored {
                StoredEntry::Record {
                    embedding,
                    created_at,
                } => {
                    let at = created_at.and_then(StoredTime::resolve).unwrap_or(now);
                    (key, embedding, at)
                }
                StoredEntry::Bare(embedding) => (key, embedding, now),
            })
            .filter(|(_, embedding, at)| !embedding.is_empty() && !self.is_expired(*at, now))
            .collect();

        // Newest first so the cap keeps the freshest entries.
        records.sort_by(|a, b| b.2.cmp(&a.2));
        records.truncate(self.config.max_entries);

        for (key, embedding, created_at) in records.into_iter().rev() {
            let touched = state.next_tick();
            let _ = state.entries.insert(
                key,
                Entry {
                    embedding,
                    created_at,
                    touched,
                },
            );
        }
        info!(entries = state.entries.len(), "embedding cache loaded");
    }

    /// Copy the entries for a flush. `None` when there is no snapshot file.
    fn take_snapshot(&self, state: &mut State) -> Option<Snapshot> {
        state.pending_writes = 0;
        let path = self.config.path.clone()?;
        state.generation += 1;
        let records = state
            .entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    StoredRecord {
                        embedding: entry.embedding.clone(),
                        created_at: entry.created_at,
                    },
                )
            })
            .collect();
        Some(Snapshot {
            path,
            generation: state.generation,
            records,
        })
    }
}

/// Encode and write `snapshot` unless a newer one is already on disk.
fn write_snapshot(snapshot: &Snapshot, written: &Mutex<u64>) -> Result<()> {
    let mut last = written.lock();
    if snapshot.generation <= *last {
        debug!(generation = snapshot.generation, "newer embedding cache snapshot already written");
        return Ok(());
    }
    let encoded = serde_json::to_vec(&snapshot.records)?;
    write_atomic(&snapshot.path, &encoded)?;
    *last = snapshot.generation;
    debug!(
        entries = snapshot.records.len(),
        path = %snapshot.path.display(),
        "embedding cache flushed"
    );
    Ok(())
}

fn record_miss(state: &mut State) {
    state.misses += 1;
    metrics::counter!("embedding_cache_misses_total").increment(1);
}

fn evict_to(state: &mut State, max_entries: usize) {
    while state.entries.len() > max_entries {
        let Some(oldest) = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone())
        else {
            return;
        };
        let _ = state.entries.remove(&oldest);
    }
}

fn read_snapshot(path: &Path) -> Result<Option<HashMap<String, StoredEntry>>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
