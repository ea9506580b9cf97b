use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bumped whenever the term-extraction algorithm changes, so stored term
/// lists from older algorithm versions can be detected and re-derived.
pub const TERMS_VERSION: &str = "v2";

/// A user note as surfaced by the external note-CRUD layer. The core never
/// persists notes itself; it only chunks and indexes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub tenant_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bounded-size fragment of a note with stable id, offsets, and both
/// lexical (terms) and dense (embedding) features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `{note_id}_{position:03}`, stable across re-indexing of unchanged text.
    pub id: String,
    pub note_id: String,
    pub tenant_id: String,
    pub text: String,
    /// First 16 hex chars of the SHA-256 of `text`. Unit of idempotence.
    pub fingerprint: String,
    pub position: u32,
    pub total_chunks: u32,
    pub token_estimate: u32,
    /// Inherited from the parent note.
    pub created_at: DateTime<Utc>,
    pub start_offset: usize,
    pub end_offset: usize,
    /// First ~50 chars of the chunk text, for client-side scroll anchoring.
    pub anchor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_context: Option<String>,
    /// Lowercased, deduplicated content words (>= 3 chars, stopwords removed).
    pub terms: Vec<String>,
    pub terms_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl Chunk {
    pub fn make_id(note_id: &str, position: u32) -> String {
        format!("{}_{:03}", note_id, position)
    }

    /// Identifier of this chunk's datapoint in the external vector index.
    pub fn datapoint_id(&self) -> String {
        format!("{}:{}", self.id, self.note_id)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

/// Which candidate streams produced a merged chunk, tracked as a bitfield
/// during the merge and materialized for scoring (multi-stream agreement
/// earns a small bonus).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSet(u8);

impl SourceSet {
    pub const VECTOR: SourceSet = SourceSet(1);
    pub const LEXICAL: SourceSet = SourceSet(2);
    pub const RECENCY: SourceSet = SourceSet(4);

    pub fn insert(&mut self, other: SourceSet) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: SourceSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Self::VECTOR) {
            out.push("vector");
        }
        if self.contains(Self::LEXICAL) {
            out.push("lexical");
        }
        if self.contains(Self::RECENCY) {
            out.push("recency");
        }
        out
    }
}

/// A chunk plus its per-feature scores. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub vector_score: f32,
    pub lexical_score: f32,
    pub recency_score: f32,
    pub combined_score: f32,
    pub cross_score: Option<f32>,
    pub sources: SourceSet,
}

impl ScoredChunk {
    pub fn unscored(chunk: Chunk, sources: SourceSet) -> Self {
        Self {
            chunk,
            vector_score: 0.0,
            lexical_score: 0.0,
            recency_score: 0.0,
            combined_score: 0.0,
            cross_score: None,
            sources,
        }
    }
}

/// Query intent, first-match classified by the analyzer's regex tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Search,
    Summarize,
    List,
    Decision,
    ActionItem,
}

impl Intent {
    /// Aggregation intents get broader recall and stricter time filtering.
    pub fn is_aggregation(&self) -> bool {
        matches!(
            self,
            Intent::Summarize | Intent::List | Intent::Decision | Intent::ActionItem
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Question => "question",
            Intent::Search => "search",
            Intent::Summarize => "summarize",
            Intent::List => "list",
            Intent::Decision => "decision",
            Intent::ActionItem => "action_item",
        }
    }
}

/// Deterministic, rule-derived view of a query. Computed once per request.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub normalized: String,
    pub keywords: Vec<String>,
    pub intent: Intent,
    pub time_hint_days: Option<u32>,
    pub entities: Vec<String>,
    pub boost_terms: Vec<String>,
}

impl QueryAnalysis {
    /// Keywords that look like unique identifiers (`deploy_v2`, `CITE_TEST_002`).
    pub fn unique_identifiers(&self) -> Vec<&str> {
        self.keywords
            .iter()
            .map(|k| k.as_str())
            .filter(|k| crate::query::analyzer::is_unique_identifier(k))
            .collect()
    }
}

/// One citation record of a source pack: the wire shape clients receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// `N<positive integer>`, unique within a response.
    pub cid: String,
    pub note_id: String,
    pub chunk_id: String,
    /// ISO-8601.
    pub created_at: String,
    pub snippet: String,
    /// Relevance in [0,1], rounded to 2 decimals.
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

/// Per-stage candidate counts for the observability line.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounts {
    pub vector: usize,
    pub lexical: usize,
    pub recency: usize,
    pub merged: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub vector_ms: u64,
    pub lexical_ms: u64,
    pub recency_ms: u64,
    pub total_ms: u64,
}

/// Shape of the surviving score list: used for precision boosting and logged
/// with every retrieval.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScoreDistribution {
    pub top: f32,
    pub gap_to_second: f32,
    pub unique_notes: usize,
}

/// The cacheable output of a full retrieval pass.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    /// Human-readable pipeline signature, e.g.
    /// `multistage_vector(163)_lexical(40)_mmr_uidboost_dedup`.
    pub strategy: String,
    pub counts: StageCounts,
    pub timings: StageTimings,
    pub distribution: ScoreDistribution,
}

/// Caller-supplied knobs for one retrieval pass.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub tenant_id: String,
    pub top_k: usize,
    pub rerank_to: usize,
    pub context_budget: Option<usize>,
    pub max_age_days: Option<u32>,
    pub keywords: Option<Vec<String>>,
}

impl RetrievalOptions {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            top_k: 30,
            rerank_to: 12,
            context_budget: None,
            max_age_days: None,
            keywords: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat HTTP surface
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub meta: ChatMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    pub model: String,
    pub retrieval: RetrievalMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalMeta {
    pub k: usize,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request body for the indexing route: a note to (re-)index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexNoteRequest {
    pub id: String,
    pub tenant_id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexNoteResponse {
    pub note_id: String,
    pub chunks_written: usize,
    pub unchanged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_zero_padded() {
        assert_eq!(Chunk::make_id("n1", 0), "n1_000");
        assert_eq!(Chunk::make_id("n1", 7), "n1_007");
        assert_eq!(Chunk::make_id("n1", 123), "n1_123");
    }

    #[test]
    fn source_set_counts_and_labels() {
        let mut s = SourceSet::default();
        assert_eq!(s.count(), 0);
        s.insert(SourceSet::VECTOR);
        s.insert(SourceSet::RECENCY);
        assert_eq!(s.count(), 2);
        assert!(s.contains(SourceSet::VECTOR));
        assert!(!s.contains(SourceSet::LEXICAL));
        assert_eq!(s.labels(), vec!["vector", "recency"]);
    }

    #[test]
    fn aggregation_intents() {
        assert!(Intent::Summarize.is_aggregation());
        assert!(Intent::Decision.is_aggregation());
        assert!(!Intent::Question.is_aggregation());
        assert!(!Intent::Search.is_aggregation());
    }
}
