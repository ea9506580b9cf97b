//! Embedding client: content-hash caching in front of an external embedding
//! model, with bounded batches, deadlines, and jittered retry.

pub mod rest;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::config::EmbeddingConfig;
use crate::core::error::{Error, Result};
use crate::index::chunker::fingerprint;

/// Maximum characters of text considered for the cache key and the model
/// input. Anything longer embeds identically to its prefix.
const NORMALIZE_CAP: usize = 8_000;
/// Fraction of the cache dropped (oldest by last access) when full.
const EVICT_FRACTION: f64 = 0.20;
const MAX_ATTEMPTS: u32 = 3;

/// External embedding model seam.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// One unit vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn model_id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EmbedderStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cache_size: usize,
}

struct CachedVector {
    vector: Vec<f32>,
    last_access: Instant,
}

/// Caching, batching front of the embedding model. A query that is the same
/// text as a stored chunk normalizes to the same cache key and reuses the
/// chunk's vector.
pub struct EmbedderClient {
    model: Arc<dyn EmbeddingModel>,
    cfg: EmbeddingConfig,
    cache: Mutex<HashMap<String, CachedVector>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Lowercase, whitespace-collapse, cap length. Applied identically to chunk
/// texts and queries so equal content shares a cache entry.
pub fn normalize_for_embedding(text: &str) -> String {
    let collapsed = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(NORMALIZE_CAP).collect()
}

impl EmbedderClient {
    pub fn new(model: Arc<dyn EmbeddingModel>, cfg: EmbeddingConfig) -> Self {
        Self {
            model,
            cfg,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> String {
        self.model.model_id().to_string()
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Embed a batch of texts, serving cache hits immediately and fetching
    /// misses from the model in bounded sub-batches. Output order matches
    /// input order.
    pub async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts
            .iter()
            .map(|t| fingerprint(&normalize_for_embedding(t)))
            .collect();

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().unwrap();
            let now = Instant::now();
            for (i, key) in keys.iter().enumerate() {
                if let Some(entry) = cache.get_mut(key) {
                    entry.last_access = now;
                    out[i] = Some(entry.vector.clone());
                } else {
                    missing.push(i);
                }
            }
        }
        self.hits
            .fetch_add((texts.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);

        for window in missing.chunks(self.cfg.batch_size.max(1)) {
            let batch: Vec<String> = window
                .iter()
                .map(|&i| normalize_for_embedding(&texts[i]))
                .collect();
            let vectors = self.call_with_retry(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(Error::Upstream(format!(
                    "embedding model returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != self.cfg.dimensions) {
                return Err(Error::Upstream(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.cfg.dimensions,
                    bad.len()
                )));
            }
            let mut cache = self.cache.lock().unwrap();
            let now = Instant::now();
            for (&i, vector) in window.iter().zip(vectors) {
                cache.insert(
                    keys[i].clone(),
                    CachedVector {
                        vector: vector.clone(),
                        last_access: now,
                    },
                );
                out[i] = Some(vector);
            }
            Self::evict_if_full(&mut cache, self.cfg.cache_max);
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| Error::Internal("embedding slot left unfilled".into())))
            .collect()
    }

    /// Single-text variant used for queries.
    pub async fn generate_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.generate_batch(&[query.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Internal("empty embedding batch result".into()))
    }

    pub fn stats(&self) -> EmbedderStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        EmbedderStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            cache_size: self.cache.lock().unwrap().len(),
        }
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let deadline = Duration::from_millis(self.cfg.timeout_ms);
        let attempts = AtomicU32::new(0);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(300))
            .with_max_interval(Duration::from_secs(3))
            .with_max_elapsed_time(None)
            .build();

        retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let result = tokio::time::timeout(deadline, self.model.embed_batch(batch)).await;
            match result {
                Ok(Ok(vectors)) => Ok(vectors),
                // Argument and configuration failures never become transient.
                Ok(Err(e @ (Error::Validation(_) | Error::Config(_)))) => {
                    Err(backoff::Error::permanent(e))
                }
                Ok(Err(e)) if attempt >= MAX_ATTEMPTS => Err(backoff::Error::permanent(e)),
                Ok(Err(e)) => {
                    tracing::debug!(attempt, "embedding attempt failed: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(_) if attempt >= MAX_ATTEMPTS => Err(backoff::Error::permanent(
                    Error::Upstream("embedding deadline exceeded".into()),
                )),
                Err(_) => Err(backoff::Error::transient(Error::Upstream(
                    "embedding deadline exceeded".into(),
                ))),
            }
        })
        .await
    }

    fn evict_if_full(cache: &mut HashMap<String, CachedVector>, max: usize) {
        if cache.len() <= max {
            return;
        }
        let drop_count = ((max as f64 * EVICT_FRACTION).ceil() as usize).max(cache.len() - max);
        let mut by_access: Vec<(Instant, String)> = cache
            .iter()
            .map(|(k, v)| (v.last_access, k.clone()))
            .collect();
        by_access.sort_by_key(|(t, _)| *t);
        for (_, key) in by_access.into_iter().take(drop_count) {
            cache.remove(&key);
        }
        tracing::debug!(dropped = drop_count, "embedding cache eviction");
    }
}
