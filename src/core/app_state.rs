use async_trait::async_trait;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

use crate::answer::generator::{GenerativeModel, GroundedGenerator};
use crate::cache::{self, TtlCache};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{Chunk, RetrievalResult};
use crate::embedding::{EmbedderClient, EmbeddingModel};
use crate::index::indexer::Indexer;
use crate::retrieval::engine::RetrievalEngine;
use crate::retrieval::rerank::CrossEncoder;
use crate::store::DocumentStore;
use crate::vector::{select_vector_index, VectorIndex};

/// Placeholder model wired in when no embedding endpoint is configured; the
/// client is flagged disabled so this is never actually called.
struct DisabledEmbedding;

#[async_trait]
impl EmbeddingModel for DisabledEmbedding {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Config("no embedding endpoint configured".into()))
    }
    fn model_id(&self) -> &str {
        "disabled"
    }
}

/// The composition root: every dependency is constructed exactly once here
/// and injected; tests swap in fakes through the same constructor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub store: Arc<dyn DocumentStore>,
    pub embedder: Arc<EmbedderClient>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub indexer: Arc<Indexer>,
    pub retrieval: Arc<RetrievalEngine>,
    pub generator: Option<Arc<GroundedGenerator>>,
    pub chunk_cache: Arc<TtlCache<Chunk>>,
    pub retrieval_cache: Arc<TtlCache<RetrievalResult>>,
    pub default_tenant: String,
}

impl AppState {
    pub fn build(
        mut config: Config,
        http_client: reqwest::Client,
        store: Arc<dyn DocumentStore>,
        embedding_model: Option<Arc<dyn EmbeddingModel>>,
        generative_model: Option<Arc<dyn GenerativeModel>>,
        cross_encoder: Option<Arc<dyn CrossEncoder>>,
    ) -> Self {
        let embedding_model = match embedding_model {
            Some(m) => m,
            None => {
                if config.embedding.enabled {
                    warn!("embeddings disabled: no embedding endpoint configured");
                    config.embedding.enabled = false;
                }
                Arc::new(DisabledEmbedding)
            }
        };
        let config = Arc::new(config);

        let embedder = Arc::new(EmbedderClient::new(
            embedding_model,
            config.embedding.clone(),
        ));
        let vector_index = select_vector_index(&config, http_client.clone(), Arc::clone(&store));

        let chunk_cache = Arc::new(cache::chunk_cache());
        let retrieval_cache = Arc::new(cache::retrieval_cache());
        chunk_cache.start_sweeper();
        retrieval_cache.start_sweeper();

        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&vector_index),
            Arc::clone(&config),
        ));

        let mut retrieval = RetrievalEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&vector_index),
            Arc::clone(&chunk_cache),
            Arc::clone(&retrieval_cache),
            Arc::clone(&config),
        );
        if let Some(cross) = cross_encoder {
            retrieval = retrieval.with_cross_encoder(cross);
        }
        if let Some(model) = generative_model.clone() {
            retrieval = retrieval.with_expander(model);
        }
        let retrieval = Arc::new(retrieval);

        let generator = match generative_model {
            Some(model) => Some(Arc::new(GroundedGenerator::new(model, Arc::clone(&config)))),
            None => {
                warn!("chat disabled: no generative endpoint configured");
                None
            }
        };

        let default_tenant = env::var("DEFAULT_TENANT_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "default".to_string());

        info!(
            vector_index = vector_index.name(),
            embeddings = config.embedding.enabled,
            chat = generator.is_some(),
            "application state assembled"
        );

        Self {
            config,
            http_client,
            store,
            embedder,
            vector_index,
            indexer,
            retrieval,
            generator,
            chunk_cache,
            retrieval_cache,
            default_tenant,
        }
    }

    /// Stop background cache sweepers (shutdown path).
    pub fn shutdown(&self) {
        self.chunk_cache.stop();
        self.retrieval_cache.stop();
    }
}
