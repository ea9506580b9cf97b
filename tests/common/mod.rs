//! Shared fakes and wiring for the end-to-end tests: an in-memory store, a
//! deterministic term-hash embedder, a scriptable generator, and a stubbed
//! vector index.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;
use notescout::answer::generator::{GenerationRequest, GenerativeModel};
use notescout::cache::{self, TtlCache};
use notescout::embedding::{EmbedderClient, EmbeddingModel};
use notescout::index::chunker::extract_terms;
use notescout::index::indexer::Indexer;
use notescout::retrieval::engine::RetrievalEngine;
use notescout::store::{DocumentStore, MemoryStore};
use notescout::vector::scan::ScanIndex;
use notescout::vector::{VectorDatapoint, VectorIndex, VectorMatch};
use notescout::{Config, Note, Result};

const DIMS: usize = 64;

/// Deterministic bag-of-terms embedding: texts sharing content words land
/// close in cosine space. Good enough to exercise the dense path end to end.
pub struct TermEmbedding;

pub fn term_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; DIMS];
    for term in extract_terms(text) {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    } else {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingModel for TermEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| term_vector(t)).collect())
    }
    fn model_id(&self) -> &str {
        "term-hash"
    }
}

/// Generator that pops scripted replies; falls back to a minimal cited
/// answer when the script runs dry.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl GenerativeModel for ScriptedGenerator {
    async fn complete(&self, _req: &GenerationRequest) -> Result<String> {
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Here is what I found [N1].".to_string()))
    }

    async fn stream_complete(
        &self,
        req: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.complete(req).await?;
        let pieces: Vec<Result<String>> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(3)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(futures::stream::iter(pieces).boxed())
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Vector index stub returning a fixed match list regardless of the query.
#[derive(Default)]
pub struct StubVectorIndex {
    pub matches: Mutex<Vec<VectorMatch>>,
}

#[async_trait]
impl VectorIndex for StubVectorIndex {
    async fn search(&self, _v: &[f32], _tenant: &str, k: usize) -> Result<Vec<VectorMatch>> {
        let mut m = self.matches.lock().unwrap().clone();
        m.truncate(k);
        Ok(m)
    }
    async fn upsert(&self, _datapoints: Vec<VectorDatapoint>) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _ids: Vec<String>) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "stub"
    }
    fn is_configured(&self) -> bool {
        true
    }
}

pub struct TestRig {
    pub store: Arc<MemoryStore>,
    pub engine: RetrievalEngine,
    pub indexer: Indexer,
    pub config: Arc<Config>,
    pub chunk_cache: Arc<TtlCache<notescout::Chunk>>,
    pub retrieval_cache: Arc<TtlCache<notescout::RetrievalResult>>,
}

pub fn rig(embeddings: bool) -> TestRig {
    let store = MemoryStore::shared();
    let index: Arc<dyn VectorIndex> = Arc::new(ScanIndex::new(store.clone()));
    rig_with_index(store, index, embeddings)
}

pub fn rig_with_index(
    store: Arc<MemoryStore>,
    index: Arc<dyn VectorIndex>,
    embeddings: bool,
) -> TestRig {
    let mut config = Config::default();
    config.embedding.enabled = embeddings;
    config.embedding.dimensions = DIMS;
    let config = Arc::new(config);

    let embedder = Arc::new(EmbedderClient::new(
        Arc::new(TermEmbedding),
        config.embedding.clone(),
    ));
    let chunk_cache = Arc::new(cache::chunk_cache());
    let retrieval_cache = Arc::new(cache::retrieval_cache());

    let engine = RetrievalEngine::new(
        store.clone() as Arc<dyn DocumentStore>,
        embedder.clone(),
        index.clone(),
        chunk_cache.clone(),
        retrieval_cache.clone(),
        config.clone(),
    );
    let indexer = Indexer::new(
        store.clone() as Arc<dyn DocumentStore>,
        embedder,
        index,
        config.clone(),
    );

    TestRig {
        store,
        engine,
        indexer,
        config,
        chunk_cache,
        retrieval_cache,
    }
}

/// Index a note aged `age_days` back from now.
pub async fn seed_note(rig: &TestRig, id: &str, tenant: &str, text: &str, age_days: i64) {
    let created = Utc::now() - Duration::days(age_days);
    let note = Note {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        text: text.to_string(),
        created_at: created,
        updated_at: created,
    };
    rig.indexer.process_note(&note).await.expect("seed note");
}
