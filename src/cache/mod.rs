//! Process-local TTL cache with hybrid LFU/LRU eviction.
//!
//! Used by the chunk hydrator and the retrieval result cache. Eviction is a
//! two-phase affair: expired entries go first; if that does not reclaim
//! enough, victims are chosen by a composite frequency+recency score, lowest
//! first, via partial selection to avoid sorting the whole table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
    last_access: Instant,
    access_count: u64,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// 0.6 weight on frequency, 0.4 on recency-within-ttl. Lower evicts first.
    fn eviction_score(&self, now: Instant) -> f64 {
        let freq = ((self.access_count + 1) as f64).log2();
        let age = now.duration_since(self.inserted_at).as_secs_f64();
        let recency = (1.0 - age / self.ttl.as_secs_f64().max(f64::EPSILON)).max(0.0);
        0.6 * freq + 0.4 * recency
    }
}

struct Inner<V> {
    name: String,
    max_size: usize,
    ttl: Duration,
    map: Mutex<HashMap<String, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(name: impl Into<String>, max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max_size: max_size.max(1),
                ttl,
                map: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweep task. Idempotent. The task holds only a
    /// weak-equivalent Arc of the table and never blocks shutdown.
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let removed = {
                    let mut map = inner.map.lock().unwrap();
                    let now = Instant::now();
                    let before = map.len();
                    map.retain(|_, e| !e.is_expired(now));
                    before - map.len()
                };
                if removed > 0 {
                    debug!(cache = %inner.name, removed, "swept expired cache entries");
                }
            }
        }));
    }

    /// Abort the sweep task. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.inner.map.lock().unwrap();
        let now = Instant::now();
        match map.get_mut(key) {
            Some(e) if !e.is_expired(now) => {
                e.access_count += 1;
                e.last_access = now;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(e.value.clone())
            }
            Some(_) => {
                map.remove(key);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn get_many(&self, keys: &[String]) -> Vec<Option<V>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn has(&self, key: &str) -> bool {
        let map = self.inner.map.lock().unwrap();
        map.get(key).is_some_and(|e| !e.is_expired(Instant::now()))
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.inner.ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut map = self.inner.map.lock().unwrap();
        let now = Instant::now();

        if let Some(e) = map.get_mut(&key) {
            e.value = value;
            e.inserted_at = now;
            e.expires_at = now + ttl;
            e.last_access = now;
            e.access_count += 1;
            e.ttl = ttl;
            return;
        }

        if map.len() >= self.inner.max_size {
            let before = map.len();
            map.retain(|_, e| !e.is_expired(now));
            if map.len() >= self.inner.max_size {
                let need = map.len() - self.inner.max_size + 1;
                Self::evict_victims(&mut map, need, now);
                self.inner
                    .evictions
                    .fetch_add(need as u64, Ordering::Relaxed);
            } else {
                debug!(
                    cache = %self.inner.name,
                    reclaimed = before - map.len(),
                    "capacity reclaim via expired entries"
                );
            }
        }

        map.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                last_access: now,
                access_count: 0,
                ttl,
            },
        );
    }

    pub fn set_many(&self, pairs: Vec<(String, V)>) {
        for (k, v) in pairs {
            self.set(k, v);
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.map.lock().unwrap().remove(key).is_some()
    }

    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut map = self.inner.map.lock().unwrap();
        let before = map.len();
        map.retain(|k, _| !k.starts_with(prefix));
        before - map.len()
    }

    pub fn clear(&self) {
        self.inner.map.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            max_size: self.inner.max_size,
            hits,
            misses,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Remove the `need` lowest-scoring entries. Partial selection: only the
    /// first `need` positions are ordered, the rest of the table is untouched.
    fn evict_victims(map: &mut HashMap<String, Entry<V>>, need: usize, now: Instant) {
        let mut scored: Vec<(f64, String)> = map
            .iter()
            .map(|(k, e)| (e.eviction_score(now), k.clone()))
            .collect();

        let need = need.min(scored.len());
        for i in 0..need {
            let mut min = i;
            for j in (i + 1)..scored.len() {
                if scored[j].0 < scored[min].0 {
                    min = j;
                }
            }
            scored.swap(i, min);
        }
        for (_, key) in scored.iter().take(need) {
            map.remove(key);
        }
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain wrappers
// ─────────────────────────────────────────────────────────────────────────────

pub const CHUNK_CACHE_TTL: Duration = Duration::from_secs(120);
pub const CHUNK_CACHE_MAX: usize = 500;
pub const RETRIEVAL_CACHE_TTL: Duration = Duration::from_secs(180);
pub const RETRIEVAL_CACHE_MAX: usize = 200;

/// Cache for hydrated chunks, keyed by chunk id. Bypasses the document store
/// for hot chunks inside the hydration window.
pub fn chunk_cache() -> TtlCache<crate::types::Chunk> {
    TtlCache::new("chunk", CHUNK_CACHE_MAX, CHUNK_CACHE_TTL)
}

/// Cache for full retrieval results.
pub fn retrieval_cache() -> TtlCache<crate::types::RetrievalResult> {
    TtlCache::new("retrieval", RETRIEVAL_CACHE_MAX, RETRIEVAL_CACHE_TTL)
}

/// Key for the retrieval cache: tenant + normalized query + time window.
/// Invariant under query case changes and internal whitespace collapsing
/// (normalization collapses whitespace; the key folds case), but varies with
/// tenant and time-window days.
pub fn retrieval_cache_key(tenant_id: &str, normalized_query: &str, window_days: Option<u32>) -> String {
    format!(
        "{}|{}|{}",
        tenant_id,
        normalized_query.to_lowercase(),
        window_days.map(|d| d.to_string()).unwrap_or_else(|| "all".to_string())
    )
}
