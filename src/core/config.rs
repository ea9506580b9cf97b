use std::env;

use crate::core::error::{Error, Result};

// ---------------------------------------------------------------------------
// Config: typed env-var configuration, loaded once at startup.
// Every operator-facing name matches the deployment environment verbatim.
// ---------------------------------------------------------------------------

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off" | "disabled"
        ),
        Err(_) => default,
    }
}

/// Chunking policy.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub target_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub overlap: usize,
}

/// Embedding client knobs.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub cache_max: usize,
}

/// Retrieval pipeline knobs.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub vector_top_k: usize,
    pub lexical_top_k: usize,
    pub lexical_max_terms: usize,
    pub recency_top_k: usize,
    pub mmr_enabled: bool,
    pub mmr_lambda: f32,
    pub min_relevance: f32,
    pub weight_vector: f32,
    pub weight_lexical: f32,
    pub weight_recency: f32,
    pub query_expansion_enabled: bool,
    pub cross_encoder_enabled: bool,
    pub llm_rerank_enabled: bool,
    pub rrf_enabled: bool,
    pub rrf_k: f32,
}

/// Generator / prompt-budget knobs.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub context_budget_chars: usize,
    pub context_reserve_chars: usize,
    pub chat_temperature: f32,
    pub chat_timeout_ms: u64,
}

/// Citation validation knobs.
#[derive(Debug, Clone)]
pub struct CitationConfig {
    pub snippet_max_chars: usize,
    pub min_overlap_score: f32,
    pub repair_enabled: bool,
    pub claim_anchoring_enabled: bool,
    pub semantic_match_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    DotProduct,
    SquaredL2,
}

impl DistanceMetric {
    fn parse(v: &str) -> Result<Self> {
        match v.to_ascii_uppercase().as_str() {
            "COSINE" => Ok(DistanceMetric::Cosine),
            "DOT_PRODUCT" => Ok(DistanceMetric::DotProduct),
            "SQUARED_L2" => Ok(DistanceMetric::SquaredL2),
            other => Err(Error::Config(format!(
                "VERTEX_DISTANCE_METRIC must be COSINE | DOT_PRODUCT | SQUARED_L2, got '{}'",
                other
            ))),
        }
    }
}

/// External ANN endpoint configuration. All fields optional: when incomplete
/// the service runs on the document-store full-scan fallback.
#[derive(Debug, Clone)]
pub struct VertexConfig {
    pub index_endpoint_resource: Option<String>,
    pub deployed_index_id: Option<String>,
    pub project: Option<String>,
    pub distance_metric: DistanceMetric,
    /// Where bearer tokens are minted (metadata server in production).
    pub token_url: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chunk: ChunkConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub citation: CitationConfig,
    pub vertex: VertexConfig,
    /// Cross-encoder sidecar endpoint, when deployed.
    pub cross_encoder_url: Option<String>,
    pub cross_encoder_timeout_ms: u64,
    pub store_write_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults match the documented operator environment.
        Self {
            chunk: ChunkConfig {
                target_size: 450,
                min_size: 80,
                max_size: 700,
                overlap: 75,
            },
            embedding: EmbeddingConfig {
                enabled: true,
                model: "text-embedding-004".to_string(),
                dimensions: 768,
                batch_size: 10,
                timeout_ms: 15_000,
                cache_max: 5_000,
            },
            retrieval: RetrievalConfig {
                vector_top_k: 500,
                lexical_top_k: 200,
                lexical_max_terms: 15,
                recency_top_k: 75,
                mmr_enabled: true,
                mmr_lambda: 0.65,
                min_relevance: 0.25,
                weight_vector: 0.40,
                weight_lexical: 0.40,
                weight_recency: 0.10,
                query_expansion_enabled: false,
                cross_encoder_enabled: true,
                llm_rerank_enabled: false,
                rrf_enabled: false,
                rrf_k: 60.0,
            },
            llm: LlmConfig {
                model: "gemini-2.5-flash".to_string(),
                context_budget_chars: 100_000,
                context_reserve_chars: 4_000,
                chat_temperature: 0.1,
                chat_timeout_ms: 30_000,
            },
            citation: CitationConfig {
                snippet_max_chars: 250,
                min_overlap_score: 0.15,
                repair_enabled: true,
                claim_anchoring_enabled: false,
                semantic_match_threshold: 0.65,
            },
            vertex: VertexConfig {
                index_endpoint_resource: None,
                deployed_index_id: None,
                project: None,
                distance_metric: DistanceMetric::Cosine,
                token_url: None,
                enabled: true,
            },
            cross_encoder_url: None,
            cross_encoder_timeout_ms: 5_000,
            store_write_batch: 400,
        }
    }
}

impl Config {
    /// Load from the process environment. Invalid values fall back to
    /// defaults except where a malformed value would silently change
    /// semantics (distance metric), which is a startup error.
    pub fn from_env() -> Result<Self> {
        let d = Config::default();

        let distance_metric = match env_str("VERTEX_DISTANCE_METRIC") {
            Some(v) => DistanceMetric::parse(&v)?,
            None => d.vertex.distance_metric,
        };

        Ok(Self {
            chunk: ChunkConfig {
                target_size: env_parse("CHUNK_TARGET_SIZE", d.chunk.target_size),
                min_size: env_parse("CHUNK_MIN_SIZE", d.chunk.min_size),
                max_size: env_parse("CHUNK_MAX_SIZE", d.chunk.max_size),
                overlap: env_parse("CHUNK_OVERLAP", d.chunk.overlap),
            },
            embedding: EmbeddingConfig {
                enabled: env_bool("EMBEDDINGS_ENABLED", d.embedding.enabled),
                model: env_str("EMBEDDING_MODEL").unwrap_or(d.embedding.model),
                dimensions: env_parse("EMBEDDING_DIMENSIONS", d.embedding.dimensions),
                batch_size: env_parse("EMBEDDING_BATCH_SIZE", d.embedding.batch_size),
                timeout_ms: env_parse("EMBEDDING_TIMEOUT_MS", d.embedding.timeout_ms),
                cache_max: env_parse("EMBEDDING_CACHE_MAX", d.embedding.cache_max),
            },
            retrieval: RetrievalConfig {
                vector_top_k: env_parse("RETRIEVAL_VECTOR_TOP_K", d.retrieval.vector_top_k),
                lexical_top_k: env_parse("RETRIEVAL_LEXICAL_TOP_K", d.retrieval.lexical_top_k),
                lexical_max_terms: env_parse(
                    "RETRIEVAL_LEXICAL_MAX_TERMS",
                    d.retrieval.lexical_max_terms,
                ),
                recency_top_k: env_parse("RETRIEVAL_RECENCY_TOP_K", d.retrieval.recency_top_k),
                mmr_enabled: env_bool("RETRIEVAL_MMR_ENABLED", d.retrieval.mmr_enabled),
                mmr_lambda: env_parse("RETRIEVAL_MMR_LAMBDA", d.retrieval.mmr_lambda),
                min_relevance: env_parse("RETRIEVAL_MIN_RELEVANCE", d.retrieval.min_relevance),
                weight_vector: env_parse("SCORE_WEIGHT_VECTOR", d.retrieval.weight_vector),
                weight_lexical: env_parse("SCORE_WEIGHT_LEXICAL", d.retrieval.weight_lexical),
                weight_recency: env_parse("SCORE_WEIGHT_RECENCY", d.retrieval.weight_recency),
                query_expansion_enabled: env_bool(
                    "RETRIEVAL_QUERY_EXPANSION_ENABLED",
                    d.retrieval.query_expansion_enabled,
                ),
                cross_encoder_enabled: env_bool(
                    "CROSS_ENCODER_ENABLED",
                    d.retrieval.cross_encoder_enabled,
                ),
                llm_rerank_enabled: env_bool("LLM_RERANK_ENABLED", d.retrieval.llm_rerank_enabled),
                rrf_enabled: env_bool("RETRIEVAL_RRF_ENABLED", d.retrieval.rrf_enabled),
                rrf_k: env_parse("RRF_K", d.retrieval.rrf_k),
            },
            llm: LlmConfig {
                model: env_str("CHAT_MODEL").unwrap_or(d.llm.model),
                context_budget_chars: env_parse(
                    "LLM_CONTEXT_BUDGET_CHARS",
                    d.llm.context_budget_chars,
                ),
                context_reserve_chars: env_parse(
                    "LLM_CONTEXT_RESERVE_CHARS",
                    d.llm.context_reserve_chars,
                ),
                chat_temperature: env_parse("CHAT_TEMPERATURE", d.llm.chat_temperature),
                chat_timeout_ms: env_parse("CHAT_TIMEOUT_MS", d.llm.chat_timeout_ms),
            },
            citation: CitationConfig {
                snippet_max_chars: env_parse("SNIPPET_MAX_CHARS", d.citation.snippet_max_chars),
                min_overlap_score: env_parse(
                    "CITATION_MIN_OVERLAP_SCORE",
                    d.citation.min_overlap_score,
                ),
                repair_enabled: env_bool("CITATION_REPAIR_ENABLED", d.citation.repair_enabled),
                claim_anchoring_enabled: env_bool(
                    "CLAIM_ANCHORING_ENABLED",
                    d.citation.claim_anchoring_enabled,
                ),
                semantic_match_threshold: env_parse(
                    "SEMANTIC_MATCH_THRESHOLD",
                    d.citation.semantic_match_threshold,
                ),
            },
            vertex: VertexConfig {
                index_endpoint_resource: env_str("VERTEX_INDEX_ENDPOINT_RESOURCE"),
                deployed_index_id: env_str("VERTEX_DEPLOYED_INDEX_ID"),
                project: env_str("VERTEX_PROJECT"),
                distance_metric,
                token_url: env_str("VERTEX_TOKEN_URL"),
                enabled: env_bool("VERTEX_ANN_ENABLED", d.vertex.enabled),
            },
            cross_encoder_url: env_str("CROSS_ENCODER_URL"),
            cross_encoder_timeout_ms: env_parse(
                "CROSS_ENCODER_TIMEOUT_MS",
                d.cross_encoder_timeout_ms,
            ),
            store_write_batch: env_parse("STORE_WRITE_BATCH", d.store_write_batch),
        })
    }

    /// Characters of source text a prompt may carry once the reserve is held
    /// back for instructions and the question.
    pub fn default_context_budget(&self) -> usize {
        self.llm
            .context_budget_chars
            .saturating_sub(self.llm.context_reserve_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_environment() {
        let c = Config::default();
        assert_eq!(c.chunk.target_size, 450);
        assert_eq!(c.chunk.min_size, 80);
        assert_eq!(c.chunk.max_size, 700);
        assert_eq!(c.chunk.overlap, 75);
        assert_eq!(c.embedding.dimensions, 768);
        assert_eq!(c.retrieval.vector_top_k, 500);
        assert_eq!(c.retrieval.recency_top_k, 75);
        assert!((c.retrieval.weight_vector - 0.40).abs() < 1e-6);
        assert!((c.retrieval.weight_recency - 0.10).abs() < 1e-6);
        assert_eq!(c.default_context_budget(), 96_000);
        assert_eq!(c.citation.snippet_max_chars, 250);
    }

    #[test]
    fn distance_metric_parsing() {
        assert_eq!(
            DistanceMetric::parse("cosine").unwrap(),
            DistanceMetric::Cosine
        );
        assert_eq!(
            DistanceMetric::parse("SQUARED_L2").unwrap(),
            DistanceMetric::SquaredL2
        );
        assert!(DistanceMetric::parse("EUCLIDEAN").is_err());
    }
}
