//! Candidate scoring: vector similarity, BM25-flavored lexical match,
//! exponential recency decay, position bonus, and the weighted combination.
//! All scores land in [0, 1].

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::core::types::ScoredChunk;
use crate::query::analyzer::is_unique_identifier;
use crate::vector::cosine_similarity;

/// Vector similarities below this are treated as noise and halved.
pub const MIN_VECTOR_SCORE: f32 = 0.15;
/// Combined scores below this never survive the first filter.
pub const MIN_COMBINED_SCORE: f32 = 0.05;
pub const POSITION_BONUS_MAX: f32 = 0.05;
/// Flat lexical bonus for a matched unique identifier.
const UID_MATCH_BONUS: f32 = 3.0;
/// Multiplier applied when the query names a unique identifier the chunk lacks.
const UID_MISS_PENALTY: f32 = 0.2;
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;
/// A keyword whose first occurrence falls inside this prefix earns the intro
/// bonus.
const INTRO_WINDOW: usize = 50;
/// Bonus per multi-stream agreement beyond the first stream.
const MULTI_SOURCE_BONUS: f32 = 0.1;

static POSITION_BONUS: Lazy<[f32; 10]> = Lazy::new(|| {
    let mut table = [0.0f32; 10];
    for (p, slot) in table.iter_mut().enumerate() {
        *slot = POSITION_BONUS_MAX * (-(p as f32) * 0.5).exp();
    }
    table
});

/// Early chunks of a note carry slightly more context-setting weight.
pub fn position_bonus(position: u32) -> f32 {
    *POSITION_BONUS.get(position as usize).unwrap_or(&0.0)
}

/// Weight triple for the combined score.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub vector: f32,
    pub lexical: f32,
    pub recency: f32,
}

impl Weights {
    /// Lexical-dominant weights used when the vector stream produced nothing.
    pub const NO_VECTOR: Weights = Weights {
        vector: 0.0,
        lexical: 0.75,
        recency: 0.25,
    };
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut pos = 0;
    while let Some(found) = haystack[pos..].find(needle) {
        count += 1;
        pos += found + needle.len();
    }
    count
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// Occurrences of `needle` bounded by non-word characters on both sides.
fn count_word_matches(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut pos = 0;
    while let Some(found) = haystack[pos..].find(needle) {
        let abs = pos + found;
        let before = haystack[..abs].chars().next_back();
        let after = haystack[abs + needle.len()..].chars().next();
        if !is_word_char(before) && !is_word_char(after) {
            count += 1;
        }
        pos = abs + needle.len();
    }
    count
}

/// BM25-like lexical scoring over the merged candidate set, min-max
/// normalized so the best candidate lands at 1.0. Unique-identifier keywords
/// bypass the frequency model: each match is a flat bonus, and a chunk that
/// lacks a queried identifier is penalized hard.
pub fn score_lexical(candidates: &mut [ScoredChunk], keywords: &[String]) {
    if candidates.is_empty() || keywords.is_empty() {
        return;
    }

    let (uid_keywords, regular): (Vec<&String>, Vec<&String>) =
        keywords.iter().partition(|k| is_unique_identifier(k));

    let lowered: Vec<String> = candidates
        .iter()
        .map(|c| c.chunk.text.to_lowercase())
        .collect();
    let n = candidates.len() as f32;
    let avg_len =
        (lowered.iter().map(|t| t.len()).sum::<usize>() as f32 / n).max(1.0);

    // Document frequency per regular keyword across this candidate set.
    let mut df: HashMap<&str, f32> = HashMap::new();
    for kw in &regular {
        let hits = lowered.iter().filter(|t| t.contains(kw.as_str())).count();
        df.insert(kw.as_str(), hits as f32);
    }

    let mut raw: Vec<f32> = Vec::with_capacity(candidates.len());
    for text in &lowered {
        let len = text.len() as f32;
        let mut score = 0.0f32;

        let uid_hits = uid_keywords
            .iter()
            .filter(|uid| text.contains(uid.as_str()))
            .count();
        score += uid_hits as f32 * UID_MATCH_BONUS;

        for kw in &regular {
            let tf = count_occurrences(text, kw) as f32;
            if tf == 0.0 {
                continue;
            }
            let dfk = df[kw.as_str()];
            let idf = ((n - dfk + 0.5) / (dfk + 0.5) + 1.0).ln();
            let tf_norm = tf * (BM25_K1 + 1.0)
                / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len));
            score += idf * tf_norm;

            if text.find(kw.as_str()).is_some_and(|at| at < INTRO_WINDOW) {
                score += idf * 0.3;
            }
            let exact = count_word_matches(text, kw);
            score += idf * 0.4 * exact as f32;
        }

        if !uid_keywords.is_empty() && uid_hits == 0 {
            score *= UID_MISS_PENALTY;
        }

        raw.push(score / keywords.len() as f32);
    }

    // Min-max normalize across the candidate set.
    let min = raw.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = raw.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    for (cand, r) in candidates.iter_mut().zip(raw) {
        cand.lexical_score = if range > f32::EPSILON {
            (r - min) / range
        } else if max > 0.0 {
            1.0
        } else {
            0.0
        };
    }
}

/// Cosine similarity against the query embedding, clamped to [0, 1], with
/// the low-signal penalty below `MIN_VECTOR_SCORE`. Chunks without a stored
/// embedding keep whatever score the ANN service reported for them.
pub fn score_vector(candidates: &mut [ScoredChunk], query_embedding: Option<&[f32]>) {
    let Some(qe) = query_embedding else {
        return;
    };
    for cand in candidates.iter_mut() {
        let raw = match cand.chunk.embedding.as_deref() {
            Some(ce) => cosine_similarity(qe, ce).clamp(0.0, 1.0),
            None => cand.vector_score,
        };
        cand.vector_score = if raw < MIN_VECTOR_SCORE { raw * 0.5 } else { raw };
    }
}

/// `exp(-age / half_life)` with `half_life = max_age_days / 3`.
pub fn score_recency(candidates: &mut [ScoredChunk], now: DateTime<Utc>, max_age_days: u32) {
    let half_life = (max_age_days as f64 / 3.0).max(0.1);
    for cand in candidates.iter_mut() {
        let age = cand.chunk.age_days(now);
        cand.recency_score = (-age / half_life).exp() as f32;
    }
}

/// Weighted combination plus position and multi-stream bonuses.
pub fn combine(candidates: &mut [ScoredChunk], weights: Weights) {
    for cand in candidates.iter_mut() {
        let base = weights.vector * cand.vector_score
            + weights.lexical * cand.lexical_score
            + weights.recency * cand.recency_score;
        let agreement = MULTI_SOURCE_BONUS * cand.sources.count().saturating_sub(1) as f32;
        cand.combined_score =
            (base + position_bonus(cand.chunk.position) + agreement).clamp(0.0, 1.0);
    }
}

/// Reciprocal-rank fusion over stream rankings: the alternative fused
/// scorer, gated by configuration. `lists` holds chunk-id rankings, best
/// first; the result maps chunk id to its RRF mass.
pub fn rrf_fuse(lists: &[Vec<String>], k: f32) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        }
    }
    scores
}

/// Score the merged candidate set in place: all four feature scores plus the
/// combination.
pub fn score_all(
    candidates: &mut [ScoredChunk],
    keywords: &[String],
    query_embedding: Option<&[f32]>,
    weights: Weights,
    now: DateTime<Utc>,
    max_age_days: u32,
) {
    score_vector(candidates, query_embedding);
    score_lexical(candidates, keywords);
    score_recency(candidates, now, max_age_days);
    combine(candidates, weights);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Chunk, SourceSet, TERMS_VERSION};
    use chrono::Duration;

    fn chunk(id: &str, text: &str, position: u32, age_days: i64) -> ScoredChunk {
        ScoredChunk::unscored(
            Chunk {
                id: id.to_string(),
                note_id: id.split('_').next().unwrap().to_string(),
                tenant_id: "t".to_string(),
                text: text.to_string(),
                fingerprint: crate::index::chunker::fingerprint(text),
                position,
                total_chunks: 1,
                token_estimate: 1,
                created_at: Utc::now() - Duration::days(age_days),
                start_offset: 0,
                end_offset: text.len(),
                anchor: text.chars().take(50).collect(),
                prev_context: None,
                next_context: None,
                terms: crate::index::chunker::extract_terms(text),
                terms_version: TERMS_VERSION.to_string(),
                embedding: None,
                embedding_model: None,
            },
            SourceSet::LEXICAL,
        )
    }

    #[test]
    fn position_bonus_decays() {
        assert!((position_bonus(0) - POSITION_BONUS_MAX).abs() < 1e-6);
        assert!(position_bonus(0) > position_bonus(1));
        assert!(position_bonus(1) > position_bonus(5));
        assert_eq!(position_bonus(50), 0.0);
    }

    #[test]
    fn lexical_prefers_matching_chunks() {
        let mut cands = vec![
            chunk("a_000", "We chose PostgreSQL over MongoDB for the backend", 0, 1),
            chunk("b_000", "Kickoff budget is $200000 for the quarter", 0, 1),
        ];
        score_lexical(&mut cands, &["postgresql".to_string(), "database".to_string()]);
        assert!(cands[0].lexical_score > cands[1].lexical_score);
        assert!((0.0..=1.0).contains(&cands[0].lexical_score));
    }

    #[test]
    fn uid_match_dominates_and_miss_is_penalized() {
        let mut with_uid = vec![
            chunk("a_000", "Reference CITE_TEST_002 lives in note B", 0, 1),
            chunk("b_000", "General text about citations and tests", 0, 1),
        ];
        score_lexical(&mut with_uid, &["cite_test_002".to_string()]);
        assert!(with_uid[0].lexical_score > with_uid[1].lexical_score);
        assert_eq!(with_uid[1].lexical_score, 0.0);
    }

    #[test]
    fn uid_presence_raises_score_vs_without() {
        let text_with = "Discussion of cite_test_002 and related work on citations";
        let text_without = "Discussion of related work on citations";
        let keywords = vec!["cite_test_002".to_string(), "citations".to_string()];

        let mut a = vec![chunk("a_000", text_with, 0, 1), chunk("c_000", "unrelated filler", 0, 1)];
        score_lexical(&mut a, &keywords);
        let mut b = vec![chunk("b_000", text_without, 0, 1), chunk("c_000", "unrelated filler", 0, 1)];
        score_lexical(&mut b, &keywords);
        // Normalized top is 1.0 in both sets; the raw separation shows in the
        // second candidate being crushed only when a uid exists.
        assert!(a[0].lexical_score >= b[0].lexical_score);
    }

    #[test]
    fn recency_decays_with_age() {
        let now = Utc::now();
        let mut cands = vec![chunk("a_000", "x", 0, 0), chunk("b_000", "x", 0, 30), chunk("c_000", "x", 0, 90)];
        score_recency(&mut cands, now, 90);
        assert!(cands[0].recency_score > cands[1].recency_score);
        assert!(cands[1].recency_score > cands[2].recency_score);
        // Half-life of 30 days: a 30-day-old chunk sits near e^-1.
        assert!((cands[1].recency_score - (-1.0f32).exp()).abs() < 0.05);
    }

    #[test]
    fn vector_low_scores_are_halved() {
        let mut cands = vec![chunk("a_000", "x", 0, 0)];
        cands[0].chunk.embedding = Some(vec![1.0, 0.0]);
        // Nearly orthogonal query: raw cosine ≈ 0.1 < threshold.
        score_vector(&mut cands, Some(&[0.1, 0.995]));
        let raw = cosine_similarity(&[0.1, 0.995], &[1.0, 0.0]);
        assert!((cands[0].vector_score - raw * 0.5).abs() < 1e-6);
    }

    #[test]
    fn combine_clamps_and_rewards_agreement() {
        let mut cands = vec![chunk("a_000", "x", 0, 0)];
        cands[0].vector_score = 0.9;
        cands[0].lexical_score = 0.9;
        cands[0].recency_score = 0.9;
        cands[0].sources.insert(SourceSet::VECTOR);
        cands[0].sources.insert(SourceSet::RECENCY);
        combine(&mut cands, Weights { vector: 0.4, lexical: 0.4, recency: 0.1 });
        let expected = 0.4 * 0.9 + 0.4 * 0.9 + 0.1 * 0.9 + position_bonus(0) + 0.1 * 2.0;
        assert!((cands[0].combined_score - expected.min(1.0)).abs() < 1e-6);
        assert!(cands[0].combined_score <= 1.0);
    }

    #[test]
    fn rrf_rewards_cross_list_agreement() {
        let lists = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ];
        let scores = rrf_fuse(&lists, 60.0);
        assert!(scores["b"] > scores["a"]);
        assert!(scores["a"] > scores["c"]);
    }
}
