//! Idempotent note indexing: diff the stored chunk fingerprints against a
//! fresh chunking of the note, rewrite only on change, backfill missing
//! embeddings, and propagate insertions/removals to the vector index.
//!
//! Failure policy: document-store writes propagate; embedding and
//! vector-index failures are logged and swallowed so the note stays
//! retrievable by lexical/recency means.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::types::{Chunk, Note};
use crate::embedding::EmbedderClient;
use crate::index::chunker::{assemble_note_chunks, normalize_note_text};
use crate::store::DocumentStore;
use crate::vector::{VectorDatapoint, VectorIndex};

#[derive(Debug, Clone, Copy)]
pub struct IndexOutcome {
    pub chunks_written: usize,
    pub unchanged: bool,
}

pub struct Indexer {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbedderClient>,
    vector_index: Arc<dyn VectorIndex>,
    config: Arc<Config>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<EmbedderClient>,
        vector_index: Arc<dyn VectorIndex>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            embedder,
            vector_index,
            config,
        }
    }

    /// Re-derive the note's chunks and reconcile the store and vector index.
    /// Unchanged text (position-wise fingerprint equality) only backfills
    /// missing embeddings.
    pub async fn process_note(&self, note: &Note) -> Result<IndexOutcome> {
        let existing = self.store.chunks_for_note(&note.id).await?;
        let normalized = normalize_note_text(&note.text);
        let mut fresh = assemble_note_chunks(
            &note.id,
            &note.tenant_id,
            note.created_at,
            &normalized,
            &self.config.chunk,
        );

        let existing_prints: Vec<&str> = existing.iter().map(|c| c.fingerprint.as_str()).collect();
        let fresh_prints: Vec<&str> = fresh.iter().map(|c| c.fingerprint.as_str()).collect();

        if existing_prints == fresh_prints {
            let backfilled = self.backfill_embeddings(&existing).await;
            debug!(note = %note.id, backfilled, "note unchanged; fingerprints match");
            return Ok(IndexOutcome {
                chunks_written: 0,
                unchanged: true,
            });
        }

        // Stale datapoints are computed from the chunks we are about to drop.
        let stale_ids: Vec<String> = existing.iter().map(|c| c.datapoint_id()).collect();
        if !existing.is_empty() {
            let ids: Vec<String> = existing.iter().map(|c| c.id.clone()).collect();
            self.store.delete_chunks(&ids).await?;
            self.spawn_vector_remove(stale_ids);
        }

        if self.embedder.enabled() {
            let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
            match self.embedder.generate_batch(&texts).await {
                Ok(vectors) => {
                    let model = self.embedder.model_id();
                    for (chunk, vector) in fresh.iter_mut().zip(vectors) {
                        chunk.embedding = Some(vector);
                        chunk.embedding_model = Some(model.clone());
                    }
                }
                Err(e) => {
                    // Not fatal: retrieval degrades to lexical + recency.
                    warn!(note = %note.id, "embedding generation failed, indexing without vectors: {}", e);
                }
            }
        }

        for batch in fresh.chunks(self.config.store_write_batch.max(1)) {
            self.store.write_chunks(batch).await?;
        }

        let datapoints: Vec<VectorDatapoint> = fresh
            .iter()
            .filter_map(|c| {
                Some(VectorDatapoint {
                    datapoint_id: c.datapoint_id(),
                    feature_vector: c.embedding.clone()?,
                    tenant_id: c.tenant_id.clone(),
                })
            })
            .collect();
        self.spawn_vector_upsert(datapoints);

        info!(
            note = %note.id,
            chunks = fresh.len(),
            replaced = existing.len(),
            "note indexed"
        );
        Ok(IndexOutcome {
            chunks_written: fresh.len(),
            unchanged: false,
        })
    }

    /// Delete every chunk of a note plus its vector datapoints.
    pub async fn remove_note(&self, note_id: &str) -> Result<usize> {
        let existing = self.store.chunks_for_note(note_id).await?;
        if existing.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = existing.iter().map(|c| c.id.clone()).collect();
        let stale: Vec<String> = existing.iter().map(|c| c.datapoint_id()).collect();
        self.store.delete_chunks(&ids).await?;
        self.spawn_vector_remove(stale);
        info!(note = note_id, chunks = ids.len(), "note removed from index");
        Ok(ids.len())
    }

    /// Generate and attach embeddings for stored chunks that lack one.
    /// Returns how many were filled. Failures are swallowed.
    async fn backfill_embeddings(&self, existing: &[Chunk]) -> usize {
        if !self.embedder.enabled() {
            return 0;
        }
        let missing: Vec<&Chunk> = existing.iter().filter(|c| c.embedding.is_none()).collect();
        if missing.is_empty() {
            return 0;
        }
        let texts: Vec<String> = missing.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embedder.generate_batch(&texts).await {
            Ok(v) => v,
            Err(e) => {
                warn!("embedding backfill failed: {}", e);
                return 0;
            }
        };
        let model = self.embedder.model_id();
        let mut datapoints = Vec::new();
        let mut filled = 0;
        for (chunk, vector) in missing.iter().zip(vectors) {
            if let Err(e) = self
                .store
                .attach_embedding(&chunk.id, vector.clone(), &model)
                .await
            {
                warn!(chunk = %chunk.id, "embedding attach failed: {}", e);
                continue;
            }
            datapoints.push(VectorDatapoint {
                datapoint_id: chunk.datapoint_id(),
                feature_vector: vector,
                tenant_id: chunk.tenant_id.clone(),
            });
            filled += 1;
        }
        self.spawn_vector_upsert(datapoints);
        filled
    }

    fn spawn_vector_upsert(&self, datapoints: Vec<VectorDatapoint>) {
        if datapoints.is_empty() {
            return;
        }
        let index = Arc::clone(&self.vector_index);
        tokio::spawn(async move {
            let count = datapoints.len();
            if let Err(e) = index.upsert(datapoints).await {
                warn!(count, "vector upsert failed (best-effort): {}", e);
            }
        });
    }

    fn spawn_vector_remove(&self, datapoint_ids: Vec<String>) {
        if datapoint_ids.is_empty() {
            return;
        }
        let index = Arc::clone(&self.vector_index);
        tokio::spawn(async move {
            let count = datapoint_ids.len();
            if let Err(e) = index.remove(datapoint_ids).await {
                warn!(count, "vector removal failed (best-effort): {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingModel;
    use crate::store::MemoryStore;
    use crate::vector::VectorMatch;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingModel for CountingModel {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
        fn model_id(&self) -> &str {
            "counting"
        }
    }

    #[derive(Default)]
    struct RecordingIndex {
        upserts: Mutex<Vec<String>>,
        removals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorIndex for RecordingIndex {
        async fn search(&self, _v: &[f32], _t: &str, _k: usize) -> Result<Vec<VectorMatch>> {
            Ok(vec![])
        }
        async fn upsert(&self, datapoints: Vec<VectorDatapoint>) -> Result<()> {
            self.upserts
                .lock()
                .unwrap()
                .extend(datapoints.into_iter().map(|d| d.datapoint_id));
            Ok(())
        }
        async fn remove(&self, ids: Vec<String>) -> Result<()> {
            self.removals.lock().unwrap().extend(ids);
            Ok(())
        }
        fn name(&self) -> &'static str {
            "recording"
        }
        fn is_configured(&self) -> bool {
            true
        }
    }

    fn build(
        embeddings_enabled: bool,
    ) -> (Indexer, Arc<MemoryStore>, Arc<RecordingIndex>, Arc<CountingModel>) {
        let store = MemoryStore::shared();
        let index = Arc::new(RecordingIndex::default());
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let mut config = Config::default();
        config.embedding.enabled = embeddings_enabled;
        config.embedding.dimensions = 3;
        let config = Arc::new(config);
        let embedder = Arc::new(EmbedderClient::new(
            model.clone(),
            config.embedding.clone(),
        ));
        let indexer = Indexer::new(store.clone(), embedder, index.clone(), config);
        (indexer, store, index, model)
    }

    fn note(id: &str, text: &str) -> Note {
        let now = Utc::now();
        Note {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            text: text.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn empty_note_writes_zero_chunks() {
        let (indexer, store, _, _) = build(true);
        let outcome = indexer.process_note(&note("n", "")).await.unwrap();
        assert_eq!(outcome.chunks_written, 0);
        assert_eq!(store.count_chunks("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn short_note_writes_one_chunk_with_offsets() {
        let (indexer, store, _, _) = build(true);
        let outcome = indexer
            .process_note(&note("n", "Budget is $50,000."))
            .await
            .unwrap();
        assert_eq!(outcome.chunks_written, 1);

        let chunks = store.chunks_for_note("n").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "n_000");
        assert_eq!(chunks[0].position, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 18);
        assert!(chunks[0].embedding.is_some());
    }

    #[tokio::test]
    async fn reprocessing_unchanged_note_is_a_noop() {
        let (indexer, store, _, model) = build(true);
        let n = note("n", "Budget is $50,000.");
        indexer.process_note(&n).await.unwrap();
        let calls_after_first = model.calls.load(Ordering::SeqCst);

        let outcome = indexer.process_note(&n).await.unwrap();
        assert!(outcome.unchanged);
        assert_eq!(outcome.chunks_written, 0);
        // Embeddings already cached/attached: no further model calls.
        assert_eq!(model.calls.load(Ordering::SeqCst), calls_after_first);

        let chunks = store.chunks_for_note("n").await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn changed_text_replaces_chunks_and_removes_stale_datapoints() {
        let (indexer, store, index, _) = build(true);
        indexer
            .process_note(&note("n", "Original text about databases."))
            .await
            .unwrap();
        let original = store.chunks_for_note("n").await.unwrap();
        assert_eq!(original.len(), 1);
        let original_fp = original[0].fingerprint.clone();

        indexer
            .process_note(&note("n", "Completely different content now."))
            .await
            .unwrap();
        let replaced = store.chunks_for_note("n").await.unwrap();
        assert_eq!(replaced.len(), 1);
        assert_ne!(replaced[0].fingerprint, original_fp);

        // Best-effort tasks are spawned; give them a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(index
            .removals
            .lock()
            .unwrap()
            .contains(&"n_000:n".to_string()));
    }

    #[tokio::test]
    async fn unchanged_note_backfills_missing_embeddings() {
        let (indexer, store, _, _) = build(false);
        let n = note("n", "Budget is $50,000.");
        indexer.process_note(&n).await.unwrap();
        assert!(store.chunks_for_note("n").await.unwrap()[0]
            .embedding
            .is_none());

        // Same note, embeddings now enabled: fingerprints match, so only the
        // missing vectors are filled in.
        let (indexer2, _, _, _) = build(true);
        let indexer2 = Indexer {
            store: store.clone(),
            ..indexer2
        };
        let outcome = indexer2.process_note(&n).await.unwrap();
        assert!(outcome.unchanged);
        assert!(store.chunks_for_note("n").await.unwrap()[0]
            .embedding
            .is_some());
    }

    #[tokio::test]
    async fn remove_note_deletes_rows() {
        let (indexer, store, index, _) = build(true);
        indexer
            .process_note(&note("n", "Something worth indexing."))
            .await
            .unwrap();
        let removed = indexer.remove_note("n").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.chunks_for_note("n").await.unwrap().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(index
            .removals
            .lock()
            .unwrap()
            .contains(&"n_000:n".to_string()));
    }
}
