//! Document-store seam. The production store is an external collaborator
//! (transactional writes, indexed queries, batch reads); the core talks to it
//! through this trait. `MemoryStore` backs tests and standalone mode.
//!
//! Required secondary indexes on the chunk collection:
//! `(tenant_id, created_at desc)`, `(note_id, position asc)`,
//! `(tenant_id, terms array-contains, created_at desc)`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::error::Result;
use crate::core::types::Chunk;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All chunks of one note, ordered by position ascending.
    async fn chunks_for_note(&self, note_id: &str) -> Result<Vec<Chunk>>;

    /// Most recent chunks for a tenant, by creation time descending.
    async fn recent_chunks(&self, tenant_id: &str, limit: usize) -> Result<Vec<Chunk>>;

    /// Chunks whose term list contains `term` (`array-contains`).
    async fn chunks_with_term(&self, tenant_id: &str, term: &str, limit: usize)
        -> Result<Vec<Chunk>>;

    /// Chunks whose term list intersects `terms` (`array-contains-any`).
    async fn chunks_with_any_term(
        &self,
        tenant_id: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Chunk>>;

    /// Batch multi-document read. The result is positionally aligned with
    /// `ids`; missing documents come back as `None`.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Option<Chunk>>>;

    /// Transactional batch write (callers slice to the store's batch limit).
    async fn write_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Transactional batch delete.
    async fn delete_chunks(&self, ids: &[String]) -> Result<()>;

    /// Attach a freshly generated embedding to an existing chunk. The only
    /// mutation a chunk document ever sees.
    async fn attach_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
        model: &str,
    ) -> Result<()>;

    async fn count_chunks(&self, tenant_id: &str) -> Result<usize>;
}

/// In-memory store with the same ordering guarantees as the production
/// indexes. Deterministic: ties on `created_at` break by chunk id.
#[derive(Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sort_recent(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
        chunks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        chunks
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn chunks_for_note(&self, note_id: &str) -> Result<Vec<Chunk>> {
        let map = self.chunks.read().await;
        let mut out: Vec<Chunk> = map
            .values()
            .filter(|c| c.note_id == note_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.position);
        Ok(out)
    }

    async fn recent_chunks(&self, tenant_id: &str, limit: usize) -> Result<Vec<Chunk>> {
        let map = self.chunks.read().await;
        let filtered: Vec<Chunk> = map
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        let mut sorted = Self::sort_recent(filtered);
        sorted.truncate(limit);
        Ok(sorted)
    }

    async fn chunks_with_term(
        &self,
        tenant_id: &str,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let map = self.chunks.read().await;
        let filtered: Vec<Chunk> = map
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.terms.iter().any(|t| t == term))
            .cloned()
            .collect();
        let mut sorted = Self::sort_recent(filtered);
        sorted.truncate(limit);
        Ok(sorted)
    }

    async fn chunks_with_any_term(
        &self,
        tenant_id: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let map = self.chunks.read().await;
        let filtered: Vec<Chunk> = map
            .values()
            .filter(|c| {
                c.tenant_id == tenant_id && c.terms.iter().any(|t| terms.iter().any(|q| q == t))
            })
            .cloned()
            .collect();
        let mut sorted = Self::sort_recent(filtered);
        sorted.truncate(limit);
        Ok(sorted)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Option<Chunk>>> {
        let map = self.chunks.read().await;
        Ok(ids.iter().map(|id| map.get(id).cloned()).collect())
    }

    async fn write_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut map = self.chunks.write().await;
        for c in chunks {
            map.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        let mut map = self.chunks.write().await;
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn attach_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
        model: &str,
    ) -> Result<()> {
        let mut map = self.chunks.write().await;
        if let Some(c) = map.get_mut(chunk_id) {
            c.embedding = Some(embedding);
            c.embedding_model = Some(model.to_string());
        }
        Ok(())
    }

    async fn count_chunks(&self, tenant_id: &str) -> Result<usize> {
        let map = self.chunks.read().await;
        Ok(map.values().filter(|c| c.tenant_id == tenant_id).count())
    }
}
