//! Full-scan fallback: when no ANN endpoint is configured, nearest-neighbor
//! search degrades to an in-memory cosine pass over the tenant's most recent
//! chunks. Correct, tenant-scoped, and fine for small corpora; warns once per
//! tenant when the corpus outgrows it.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::core::error::Result;
use crate::store::DocumentStore;
use crate::vector::{cosine_similarity, VectorDatapoint, VectorIndex, VectorMatch};

/// Upper bound on chunks pulled per search.
pub const SCAN_INDEX_MAX_CHUNKS: usize = 2_000;
/// Corpus size past which the scan is called out as a scaling hazard.
pub const SCAN_WARN_THRESHOLD: usize = 1_000;

pub struct ScanIndex {
    store: Arc<dyn DocumentStore>,
    warned_tenants: Mutex<HashSet<String>>,
}

impl ScanIndex {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            warned_tenants: Mutex::new(HashSet::new()),
        }
    }

    fn warn_once(&self, tenant_id: &str, corpus: usize) {
        let mut warned = self.warned_tenants.lock().unwrap();
        if warned.insert(tenant_id.to_string()) {
            warn!(
                tenant = tenant_id,
                corpus,
                threshold = SCAN_WARN_THRESHOLD,
                "vector fallback is full-scanning a large corpus; configure the ANN endpoint"
            );
        }
    }
}

#[async_trait]
impl VectorIndex for ScanIndex {
    async fn search(&self, vector: &[f32], tenant_id: &str, k: usize) -> Result<Vec<VectorMatch>> {
        let chunks = self
            .store
            .recent_chunks(tenant_id, SCAN_INDEX_MAX_CHUNKS)
            .await?;
        if chunks.len() > SCAN_WARN_THRESHOLD {
            self.warn_once(tenant_id, chunks.len());
        }

        let mut scored: Vec<VectorMatch> = chunks
            .iter()
            .filter_map(|c| {
                let emb = c.embedding.as_ref()?;
                Some(VectorMatch {
                    chunk_id: c.id.clone(),
                    note_id: c.note_id.clone(),
                    score: cosine_similarity(vector, emb).clamp(0.0, 1.0),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Embeddings already live on the chunk documents; there is nothing to
    /// propagate.
    async fn upsert(&self, _datapoints: Vec<VectorDatapoint>) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _datapoint_ids: Vec<String>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fallback_scan"
    }

    fn is_configured(&self) -> bool {
        true
    }
}
