//! The retrieval engine: parallel dense/lexical/recency candidate
//! generation, set-union merge, fused scoring, diversity/coverage reranking,
//! and context-budgeted assembly, with a multi-layer cache in front.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::answer::generator::{GenerationRequest, GenerativeModel};
use crate::cache::{retrieval_cache_key, TtlCache};
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::types::{
    Chunk, QueryAnalysis, RetrievalOptions, RetrievalResult, ScoreDistribution, ScoredChunk,
    SourceSet, StageCounts, StageTimings,
};
use crate::embedding::EmbedderClient;
use crate::index::chunker::fingerprint;
use crate::query::analyzer::analyze;
use crate::retrieval::rerank::{
    self, CrossEncoder, CROSS_ENCODER_MAX_CHUNKS, LLM_RERANK_MAX_CHUNKS,
};
use crate::retrieval::scoring::{self, Weights, MIN_COMBINED_SCORE};
use crate::retrieval::assemble::assemble_context;
use crate::store::DocumentStore;
use crate::vector::VectorIndex;

/// Time window and per-stage cap used when the query names a unique
/// identifier or asks for all-time recall.
pub const ENTITY_EXPANDED_DAYS: u32 = 365;
pub const ENTITY_EXPANDED_LIMIT: usize = 500;
/// Hard cap on chunks hydrated from the store per vector search.
pub const BATCH_HYDRATION_MAX: usize = 500;
/// Recency half-life window when nothing narrower applies.
const DEFAULT_MAX_AGE_DAYS: u32 = 90;
/// Queries shorter than this skip the result cache.
const CACHE_MIN_QUERY_LEN: usize = 5;
/// Hydration-miss fraction that flags vector-index drift.
const DRIFT_WARN_RATIO: f64 = 0.15;
const DRIFT_SAMPLE: usize = 5;
const LEXICAL_PER_TERM_CAP: usize = 75;
const LEXICAL_FANOUT_MAX: usize = 8;
const EXPANSION_CACHE_TTL: Duration = Duration::from_secs(300);
const CROSS_CACHE_TTL: Duration = Duration::from_secs(300);
/// Precision boost: with a strong, separated leader the floor tightens.
const PRECISION_MIN_SURVIVORS: usize = 5;
const PRECISION_TOP_SCORE: f32 = 0.70;
const PRECISION_GAP: f32 = 0.25;
const PRECISION_THRESHOLD: f32 = 0.25;
/// Aggregation intents relax the final relevance floor to this.
const AGGREGATION_MIN_RELEVANCE: f32 = 0.10;

static ALL_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(all|ever|history|first|oldest|earliest)\b").unwrap());

struct VectorStream {
    hydrated: Vec<(Chunk, f32)>,
    query_embedding: Option<Vec<f32>>,
    count: usize,
    elapsed_ms: u64,
}

pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbedderClient>,
    vector_index: Arc<dyn VectorIndex>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    /// Generator used for query expansion and LLM rerank when those stages
    /// are enabled.
    expander: Option<Arc<dyn GenerativeModel>>,
    chunk_cache: Arc<TtlCache<Chunk>>,
    retrieval_cache: Arc<TtlCache<RetrievalResult>>,
    expansion_cache: TtlCache<Vec<String>>,
    cross_cache: TtlCache<Vec<f32>>,
    config: Arc<Config>,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<EmbedderClient>,
        vector_index: Arc<dyn VectorIndex>,
        chunk_cache: Arc<TtlCache<Chunk>>,
        retrieval_cache: Arc<TtlCache<RetrievalResult>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            embedder,
            vector_index,
            cross_encoder: None,
            expander: None,
            chunk_cache,
            retrieval_cache,
            expansion_cache: TtlCache::new("query_expansion", 200, EXPANSION_CACHE_TTL),
            cross_cache: TtlCache::new("cross_encoder", 200, CROSS_CACHE_TTL),
            config,
        }
    }

    pub fn with_cross_encoder(mut self, cross: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(cross);
        self
    }

    pub fn with_expander(mut self, model: Arc<dyn GenerativeModel>) -> Self {
        self.expander = Some(model);
        self
    }

    /// Run the full pipeline for one query.
    pub async fn retrieve(
        &self,
        query: &str,
        opts: &RetrievalOptions,
    ) -> Result<(RetrievalResult, QueryAnalysis)> {
        let started = Instant::now();
        let now = Utc::now();
        let analysis = analyze(query);
        let uids: Vec<String> = analysis
            .unique_identifiers()
            .into_iter()
            .map(str::to_string)
            .collect();

        // Unique identifiers and all-time phrasing widen both the recency
        // window and the per-stage candidate caps.
        let expanded = !uids.is_empty() || ALL_TIME.is_match(&analysis.normalized);
        let window_days = analysis.time_hint_days;
        let max_age_days = opts
            .max_age_days
            .or(window_days)
            .unwrap_or(if expanded { ENTITY_EXPANDED_DAYS } else { DEFAULT_MAX_AGE_DAYS });

        let cacheable = analysis.normalized.len() >= CACHE_MIN_QUERY_LEN;
        let cache_key = retrieval_cache_key(&opts.tenant_id, &analysis.normalized, window_days);
        if cacheable {
            if let Some(mut hit) = self.retrieval_cache.get(&cache_key) {
                hit.strategy.push_str("_cached");
                debug!(key = %cache_key, "retrieval cache hit");
                return Ok((hit, analysis));
            }
        }

        let vector_limit = if expanded { ENTITY_EXPANDED_LIMIT } else { self.config.retrieval.vector_top_k };
        let lexical_limit = if expanded { ENTITY_EXPANDED_LIMIT } else { self.config.retrieval.lexical_top_k };
        // Boost terms (keywords plus intent synonyms) drive both lexical
        // matching and scoring: "what did we decide" must reach a note that
        // says "we chose".
        let keywords: Vec<String> = opts
            .keywords
            .clone()
            .unwrap_or_else(|| analysis.boost_terms.clone());

        // ── Parallel candidate generation ────────────────────────────────
        let (vector_stream, lexical_out, recency_out) = tokio::join!(
            self.vector_candidates(&analysis.normalized, &opts.tenant_id, vector_limit),
            self.lexical_candidates(&analysis.normalized, &keywords, &opts.tenant_id, lexical_limit),
            self.recency_candidates(&opts.tenant_id),
        );
        let vector_stream = vector_stream?;
        let (lexical_chunks, lexical_ms) = lexical_out?;
        let (recency_chunks, recency_ms) = recency_out?;

        let counts_seed = StageCounts {
            vector: vector_stream.count,
            lexical: lexical_chunks.len(),
            recency: recency_chunks.len(),
            merged: 0,
        };

        // ── Merge: vector first, lexical second, recency last ────────────
        let mut merged: Vec<ScoredChunk> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (chunk, ann_score) in vector_stream.hydrated {
            let idx = merged.len();
            by_id.insert(chunk.id.clone(), idx);
            let mut sc = ScoredChunk::unscored(chunk, SourceSet::VECTOR);
            sc.vector_score = ann_score;
            merged.push(sc);
        }
        for chunk in lexical_chunks {
            match by_id.get(&chunk.id) {
                Some(&i) => merged[i].sources.insert(SourceSet::LEXICAL),
                None => {
                    by_id.insert(chunk.id.clone(), merged.len());
                    merged.push(ScoredChunk::unscored(chunk, SourceSet::LEXICAL));
                }
            }
        }
        for chunk in &recency_chunks {
            match by_id.get(&chunk.id) {
                Some(&i) => merged[i].sources.insert(SourceSet::RECENCY),
                None => {
                    by_id.insert(chunk.id.clone(), merged.len());
                    merged.push(ScoredChunk::unscored(chunk.clone(), SourceSet::RECENCY));
                }
            }
        }
        let counts = StageCounts {
            merged: merged.len(),
            ..counts_seed
        };

        // ── Time-hint hard filter (aggregation intents only) ─────────────
        let mut time_filtered = false;
        let mut recency_fallback = false;
        if analysis.intent.is_aggregation() {
            if let Some(days) = window_days {
                let cutoff = now - ChronoDuration::days(days as i64);
                merged.retain(|c| c.chunk.created_at >= cutoff);
                time_filtered = true;
                if merged.is_empty() && !recency_chunks.is_empty() {
                    merged = recency_chunks
                        .iter()
                        .map(|c| ScoredChunk::unscored(c.clone(), SourceSet::RECENCY))
                        .collect();
                    recency_fallback = true;
                }
            }
        }

        // ── Scoring ──────────────────────────────────────────────────────
        let weights = if counts.vector > 0 {
            Weights {
                vector: self.config.retrieval.weight_vector,
                lexical: self.config.retrieval.weight_lexical,
                recency: self.config.retrieval.weight_recency,
            }
        } else {
            Weights::NO_VECTOR
        };
        scoring::score_all(
            &mut merged,
            &keywords,
            vector_stream.query_embedding.as_deref(),
            weights,
            now,
            max_age_days,
        );

        if self.config.retrieval.rrf_enabled {
            Self::apply_rrf(&mut merged, self.config.retrieval.rrf_k);
        }

        // ── Filter and sort, with the precision boost ────────────────────
        rerank::sort_by_score(&mut merged);
        merged.retain(|c| c.combined_score >= MIN_COMBINED_SCORE);
        let mut precision_boosted = false;
        if merged.len() >= PRECISION_MIN_SURVIVORS
            && merged[0].combined_score >= PRECISION_TOP_SCORE
            && merged[0].combined_score - merged[PRECISION_MIN_SURVIVORS - 1].combined_score
                >= PRECISION_GAP
        {
            merged.retain(|c| c.combined_score >= PRECISION_THRESHOLD);
            precision_boosted = true;
        }

        // ── Rerank stages, each pure, in the configured default order ────
        let mut stages: Vec<&'static str> = Vec::new();
        if self.config.retrieval.mmr_enabled && merged.len() > 1 {
            merged = rerank::mmr_select(merged, opts.top_k, self.config.retrieval.mmr_lambda);
            stages.push("mmr");
        } else {
            merged.truncate(opts.top_k);
        }
        if !uids.is_empty() && !merged.is_empty() {
            merged = rerank::uid_boost(merged, &uids);
            stages.push("uidboost");
        }
        if merged.len() > opts.rerank_to && keywords.len() > 1 {
            merged = rerank::coverage_rerank(merged, &keywords, opts.rerank_to);
            stages.push("coverage");
        }
        if self.config.retrieval.cross_encoder_enabled && !merged.is_empty() {
            if let Some(cross) = self.cross_encoder.clone() {
                if let Some(reranked) = self.cross_encode(&analysis.normalized, merged.clone(), cross).await {
                    merged = reranked;
                    stages.push("crossenc");
                }
            }
        }
        if self.config.retrieval.llm_rerank_enabled && merged.len() > 1 {
            if let Some(model) = self.expander.clone() {
                if let Some(reranked) = self.llm_rerank(&analysis.normalized, merged.clone(), model).await {
                    merged = reranked;
                    stages.push("llmrerank");
                }
            }
        }
        if merged.len() > 1 {
            merged = rerank::text_dedup(merged);
            stages.push("dedup");
        }
        let before_gap = merged.len();
        merged = rerank::score_gap_truncate(merged, analysis.intent);
        if merged.len() < before_gap {
            stages.push("gapcut");
        }

        // ── Final relevance floor and cut ────────────────────────────────
        let min_relevance = if analysis.intent.is_aggregation() {
            self.config.retrieval.min_relevance.min(AGGREGATION_MIN_RELEVANCE)
        } else {
            self.config.retrieval.min_relevance
        };
        merged.retain(|c| c.combined_score >= min_relevance);
        merged.truncate(opts.rerank_to);

        // ── Context assembly ─────────────────────────────────────────────
        let budget = opts
            .context_budget
            .unwrap_or_else(|| self.config.default_context_budget());
        let final_chunks = assemble_context(merged, budget, analysis.intent);

        // ── Strategy signature and observability ─────────────────────────
        let mut strategy = String::from("multistage");
        if counts.vector > 0 {
            strategy.push_str(&format!("_vector({})", counts.vector));
        }
        if counts.lexical > 0 {
            strategy.push_str(&format!("_lexical({})", counts.lexical));
        }
        if counts.recency > 0 {
            strategy.push_str("_recency");
        }
        if time_filtered {
            strategy.push_str(&format!("_time_filtered({}d)", window_days.unwrap_or(0)));
        }
        if recency_fallback {
            strategy.push_str("_recency_fallback");
        }
        if precision_boosted {
            strategy.push_str("_precision");
        }
        for s in &stages {
            strategy.push('_');
            strategy.push_str(s);
        }
        if final_chunks.is_empty() {
            strategy.push_str("_no_candidates");
        }

        let distribution = ScoreDistribution {
            top: final_chunks.first().map(|c| c.combined_score).unwrap_or(0.0),
            gap_to_second: match (final_chunks.first(), final_chunks.get(1)) {
                (Some(a), Some(b)) => a.combined_score - b.combined_score,
                _ => 0.0,
            },
            unique_notes: {
                let mut notes: Vec<&str> =
                    final_chunks.iter().map(|c| c.chunk.note_id.as_str()).collect();
                notes.sort_unstable();
                notes.dedup();
                notes.len()
            },
        };
        let timings = StageTimings {
            vector_ms: vector_stream.elapsed_ms,
            lexical_ms,
            recency_ms,
            total_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            tenant = %opts.tenant_id,
            intent = analysis.intent.as_str(),
            strategy = %strategy,
            vector = counts.vector,
            lexical = counts.lexical,
            recency = counts.recency,
            merged = counts.merged,
            returned = final_chunks.len(),
            top_score = distribution.top,
            unique_notes = distribution.unique_notes,
            elapsed_ms = timings.total_ms,
            "retrieval complete"
        );

        let result = RetrievalResult {
            chunks: final_chunks,
            strategy,
            counts,
            timings,
            distribution,
        };
        if cacheable {
            self.retrieval_cache.set(cache_key, result.clone());
        }
        Ok((result, analysis))
    }

    /// Dense candidate stream: embed the query, search the index, hydrate
    /// matches through the chunk cache and a batched store read, preserving
    /// the service's rank. Embedder/index failures degrade to an empty
    /// stream; store failures propagate.
    async fn vector_candidates(
        &self,
        normalized_query: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<VectorStream> {
        let t0 = Instant::now();
        let empty = |ms: u64| VectorStream {
            hydrated: Vec::new(),
            query_embedding: None,
            count: 0,
            elapsed_ms: ms,
        };
        if !self.embedder.enabled() || normalized_query.is_empty() {
            return Ok(empty(0));
        }

        let query_embedding = match self.embedder.generate_query(normalized_query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, degrading to lexical+recency: {}", e);
                return Ok(empty(t0.elapsed().as_millis() as u64));
            }
        };

        let matches = match self
            .vector_index
            .search(&query_embedding, tenant_id, limit)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(index = self.vector_index.name(), "vector search failed: {}", e);
                return Ok(VectorStream {
                    query_embedding: Some(query_embedding),
                    ..empty(t0.elapsed().as_millis() as u64)
                });
            }
        };

        let matches: Vec<_> = matches.into_iter().take(BATCH_HYDRATION_MAX).collect();
        let requested = matches.len();

        // Cache hits first; the rest in one batched read, order preserved.
        let mut slots: Vec<Option<Chunk>> = Vec::with_capacity(requested);
        let mut fetch: Vec<(usize, String)> = Vec::new();
        for (i, m) in matches.iter().enumerate() {
            match self.chunk_cache.get(&m.chunk_id) {
                Some(c) => slots.push(Some(c)),
                None => {
                    slots.push(None);
                    fetch.push((i, m.chunk_id.clone()));
                }
            }
        }
        if !fetch.is_empty() {
            let ids: Vec<String> = fetch.iter().map(|(_, id)| id.clone()).collect();
            let fetched = self.store.get_chunks(&ids).await?;
            for ((slot_idx, _), chunk) in fetch.into_iter().zip(fetched) {
                if let Some(c) = &chunk {
                    self.chunk_cache.set(c.id.clone(), c.clone());
                }
                slots[slot_idx] = chunk;
            }
        }

        let mut hydrated: Vec<(Chunk, f32)> = Vec::with_capacity(requested);
        let mut missing: Vec<String> = Vec::new();
        for (m, slot) in matches.iter().zip(slots) {
            match slot {
                Some(chunk) => hydrated.push((chunk, m.score)),
                None => missing.push(format!("{}:{}", m.chunk_id, m.note_id)),
            }
        }

        if requested > 0 {
            let missing_ratio = missing.len() as f64 / requested as f64;
            if missing_ratio > DRIFT_WARN_RATIO {
                // Orphan datapoints: the ANN index references chunks the
                // store no longer has.
                warn!(
                    drift_detected = true,
                    missing = missing.len(),
                    requested,
                    missing_ratio = format!("{:.2}", missing_ratio).as_str(),
                    sample = ?missing.iter().take(DRIFT_SAMPLE).collect::<Vec<_>>(),
                    "vector index drift detected"
                );
            }
        }

        Ok(VectorStream {
            count: hydrated.len(),
            hydrated,
            query_embedding: Some(query_embedding),
            elapsed_ms: t0.elapsed().as_millis() as u64,
        })
    }

    /// Lexical candidate stream: rarity-ranked term selection, then either a
    /// single `array-contains-any` or a capped parallel per-term fan-out
    /// unioned and ranked by term-match count.
    async fn lexical_candidates(
        &self,
        normalized_query: &str,
        keywords: &[String],
        tenant_id: &str,
        total_cap: usize,
    ) -> Result<(Vec<Chunk>, u64)> {
        let t0 = Instant::now();
        if keywords.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let mut terms: Vec<String> = keywords.to_vec();
        if self.config.retrieval.query_expansion_enabled {
            if let Some(model) = self.expander.clone() {
                for t in self.expansion_terms(normalized_query, model).await {
                    if !terms.contains(&t) {
                        terms.push(t);
                    }
                }
            }
        }

        let fanout = LEXICAL_FANOUT_MAX.min(self.config.retrieval.lexical_max_terms);
        let selected = select_rarest_terms(&terms, fanout);

        let mut matched: Vec<Chunk>;
        if selected.len() == 1 {
            matched = self
                .store
                .chunks_with_any_term(tenant_id, &selected, LEXICAL_PER_TERM_CAP)
                .await?;
        } else {
            let futures = selected.iter().map(|term| {
                self.store
                    .chunks_with_term(tenant_id, term, LEXICAL_PER_TERM_CAP)
            });
            let batches = join_all(futures).await;

            // Union by id, ranked by how many terms matched.
            let mut union: Vec<Chunk> = Vec::new();
            let mut match_count: HashMap<String, usize> = HashMap::new();
            for batch in batches {
                for chunk in batch? {
                    let entry = match_count.entry(chunk.id.clone()).or_insert(0);
                    *entry += 1;
                    if *entry == 1 {
                        union.push(chunk);
                    }
                }
            }
            union.sort_by(|a, b| match_count[&b.id].cmp(&match_count[&a.id]));
            matched = union;
        }
        matched.truncate(total_cap);
        Ok((matched, t0.elapsed().as_millis() as u64))
    }

    async fn recency_candidates(&self, tenant_id: &str) -> Result<(Vec<Chunk>, u64)> {
        let t0 = Instant::now();
        let chunks = self
            .store
            .recent_chunks(tenant_id, self.config.retrieval.recency_top_k)
            .await?;
        Ok((chunks, t0.elapsed().as_millis() as u64))
    }

    /// Ask the generator for up to two paraphrases and mine them for extra
    /// lexical terms. Cached per normalized query; failures yield nothing.
    async fn expansion_terms(
        &self,
        normalized_query: &str,
        model: Arc<dyn GenerativeModel>,
    ) -> Vec<String> {
        if let Some(cached) = self.expansion_cache.get(normalized_query) {
            return cached;
        }
        let req = GenerationRequest {
            system: "You rewrite search queries. Reply with up to 2 alternative phrasings of the query, one per line, nothing else.".to_string(),
            user: normalized_query.to_string(),
            temperature: 0.7,
            max_tokens: Some(100),
        };
        let response = match tokio::time::timeout(
            Duration::from_millis(self.config.llm.chat_timeout_ms),
            model.complete(&req),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("query expansion failed: {}", e);
                return Vec::new();
            }
            Err(_) => {
                warn!("query expansion timed out");
                return Vec::new();
            }
        };

        let mut out: Vec<String> = Vec::new();
        for line in response.lines().filter(|l| !l.trim().is_empty()).take(2) {
            for term in crate::index::chunker::extract_terms(line) {
                if !out.contains(&term) {
                    out.push(term);
                }
            }
        }
        self.expansion_cache
            .set(normalized_query.to_string(), out.clone());
        out
    }

    /// Cross-encoder pass over the head of the list. Returns None when the
    /// sidecar fails, which skips the stage.
    async fn cross_encode(
        &self,
        query: &str,
        merged: Vec<ScoredChunk>,
        cross: Arc<dyn CrossEncoder>,
    ) -> Option<Vec<ScoredChunk>> {
        let top_n = CROSS_ENCODER_MAX_CHUNKS.min(merged.len());
        let (head, tail) = {
            let mut m = merged;
            let tail = m.split_off(top_n);
            (m, tail)
        };

        let mut ids: Vec<&str> = head.iter().map(|c| c.chunk.id.as_str()).collect();
        ids.sort_unstable();
        let cache_key = fingerprint(&format!("{}|{}", query, ids.join(",")));

        let scores = match self.cross_cache.get(&cache_key) {
            Some(s) => s,
            None => {
                let texts: Vec<String> = head.iter().map(|c| c.chunk.text.clone()).collect();
                let scored = tokio::time::timeout(
                    Duration::from_millis(self.config.cross_encoder_timeout_ms),
                    cross.score(query, &texts),
                )
                .await;
                match scored {
                    Ok(Ok(s)) if s.len() == texts.len() => {
                        self.cross_cache.set(cache_key, s.clone());
                        s
                    }
                    Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                        warn!("cross-encoder unavailable, skipping stage");
                        return None;
                    }
                }
            }
        };

        let mut out = rerank::blend_cross_scores(head, &scores);
        out.extend(tail);
        Some(out)
    }

    /// LLM rerank over the head of the list: ask for a ranking, parse the
    /// first n distinct integers as a permutation.
    async fn llm_rerank(
        &self,
        query: &str,
        merged: Vec<ScoredChunk>,
        model: Arc<dyn GenerativeModel>,
    ) -> Option<Vec<ScoredChunk>> {
        let top_n = LLM_RERANK_MAX_CHUNKS.min(merged.len());
        let (head, tail) = {
            let mut m = merged;
            let tail = m.split_off(top_n);
            (m, tail)
        };

        let listing: String = head
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let preview: String = c.chunk.text.chars().take(300).collect();
                format!("{}. {}", i + 1, preview)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let req = GenerationRequest {
            system: "Rank the numbered passages by relevance to the question. Reply with the numbers only, best first.".to_string(),
            user: format!("Question: {}\n\nPassages:\n{}", query, listing),
            temperature: 0.0,
            max_tokens: Some(100),
        };

        let response = match tokio::time::timeout(
            Duration::from_millis(self.config.llm.chat_timeout_ms),
            model.complete(&req),
        )
        .await
        {
            Ok(Ok(text)) => text,
            _ => {
                warn!("llm rerank unavailable, skipping stage");
                return None;
            }
        };

        let order = rerank::parse_rerank_permutation(&response, head.len());
        let mut out = rerank::apply_permutation(head, &order);
        out.extend(tail);
        Some(out)
    }

    /// Alternative fused scorer: replace the weighted blend with min-max
    /// normalized reciprocal-rank fusion over the per-stream rankings.
    fn apply_rrf(merged: &mut [ScoredChunk], k: f32) {
        let mut streams: Vec<Vec<String>> = vec![Vec::new(), Vec::new(), Vec::new()];
        for c in merged.iter() {
            if c.sources.contains(SourceSet::VECTOR) {
                streams[0].push(c.chunk.id.clone());
            }
            if c.sources.contains(SourceSet::LEXICAL) {
                streams[1].push(c.chunk.id.clone());
            }
            if c.sources.contains(SourceSet::RECENCY) {
                streams[2].push(c.chunk.id.clone());
            }
        }
        let fused = scoring::rrf_fuse(&streams, k);
        let max = fused.values().cloned().fold(f32::MIN, f32::max);
        let min = fused.values().cloned().fold(f32::MAX, f32::min);
        let range = (max - min).max(f32::EPSILON);
        for c in merged.iter_mut() {
            if let Some(&s) = fused.get(&c.chunk.id) {
                c.combined_score = ((s - min) / range).clamp(0.0, 1.0);
            }
        }
    }
}

/// Rarity heuristic for lexical term selection: longer terms and terms with
/// digits or underscores are rarer and more selective.
fn select_rarest_terms(terms: &[String], n: usize) -> Vec<String> {
    let mut scored: Vec<(i32, &String)> = terms
        .iter()
        .map(|t| {
            let mut score = t.len() as i32;
            if t.chars().any(|c| c.is_ascii_digit() || c == '_') {
                score += 10;
            }
            if t.len() < 4 {
                score -= 3;
            }
            (score, t)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(n).map(|(_, t)| t.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rarest_terms_prefer_identifiers_and_length() {
        let terms = vec![
            "the".to_string(),
            "database".to_string(),
            "cite_test_002".to_string(),
            "big".to_string(),
        ];
        let out = select_rarest_terms(&terms, 2);
        assert_eq!(out[0], "cite_test_002");
        assert_eq!(out[1], "database");
    }

    #[test]
    fn all_time_patterns_match() {
        assert!(ALL_TIME.is_match("show me the first note ever"));
        assert!(ALL_TIME.is_match("my oldest meeting notes"));
        assert!(!ALL_TIME.is_match("recent meeting notes"));
    }
}
