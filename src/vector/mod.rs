//! Vector index capability seam: the external ANN service when configured,
//! else a full-scan fallback over the document store. Both variants return
//! matches in score-descending order with scores in [0, 1].

pub mod ann;
pub mod scan;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::info;

use crate::core::config::Config;
use crate::core::error::Result;
use crate::store::DocumentStore;

/// One nearest-neighbor hit. `chunk_id`/`note_id` are split back out of the
/// `{chunk_id}:{note_id}` datapoint identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: String,
    pub note_id: String,
    pub score: f32,
}

/// Upsert payload: datapoint id, dense vector, tenant restrict.
#[derive(Debug, Clone)]
pub struct VectorDatapoint {
    pub datapoint_id: String,
    pub feature_vector: Vec<f32>,
    pub tenant_id: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, vector: &[f32], tenant_id: &str, k: usize) -> Result<Vec<VectorMatch>>;
    async fn upsert(&self, datapoints: Vec<VectorDatapoint>) -> Result<()>;
    async fn remove(&self, datapoint_ids: Vec<String>) -> Result<()>;
    fn name(&self) -> &'static str;
    fn is_configured(&self) -> bool;
}

static ENDPOINT_RESOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^projects/[^/]+/locations/[^/]+/indexEndpoints/[^/]+$").unwrap());

/// Whether the remote ANN configuration is complete enough to use.
pub fn ann_configured(cfg: &Config) -> bool {
    cfg.vertex.enabled
        && cfg.vertex.project.is_some()
        && cfg.vertex.deployed_index_id.is_some()
        && cfg
            .vertex
            .index_endpoint_resource
            .as_deref()
            .is_some_and(|r| ENDPOINT_RESOURCE.is_match(r))
}

/// Choose the index variant once at startup.
pub fn select_vector_index(
    cfg: &Config,
    http_client: reqwest::Client,
    store: Arc<dyn DocumentStore>,
) -> Arc<dyn VectorIndex> {
    if ann_configured(cfg) {
        let index = ann::RemoteAnnIndex::new(http_client, cfg.vertex.clone());
        info!(index = index.name(), "vector index: remote ANN endpoint");
        Arc::new(index)
    } else {
        info!("vector index: ANN not configured, using document-store full scan");
        Arc::new(scan::ScanIndex::new(store))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Split a `{chunk_id}:{note_id}` datapoint identifier.
pub fn parse_datapoint_id(id: &str) -> Option<(String, String)> {
    id.split_once(':')
        .map(|(c, n)| (c.to_string(), n.to_string()))
}
