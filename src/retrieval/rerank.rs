//! Rerank stages. Every stage is a pure function over the scored list so the
//! engine controls their order and each can be gated independently.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::core::error::Result;
use crate::core::types::{Intent, ScoredChunk};
use crate::vector::cosine_similarity;

/// Jaccard similarity above which two chunks count as near-duplicates.
pub const NEAR_DUP_JACCARD: f32 = 0.85;
/// Cosine similarity above which two embedded chunks count as semantic
/// duplicates.
pub const SEMANTIC_DUP_COSINE: f32 = 0.92;
/// Similarity assumed between chunks of the same parent note.
const SAME_NOTE_SIM: f32 = 0.8;
/// Scale on cosine similarity when used as the MMR diversity term.
const EMBEDDING_SIM_SCALE: f32 = 0.6;
/// Per-matched-identifier multiplier in the precision boost.
const UID_BOOST_PER_MATCH: f32 = 0.5;
/// Score-gap truncation only fires when the leader is at least this strong.
const GAP_TOP_FLOOR: f32 = 0.60;
/// A consecutive drop this large past rank 2 ends the list.
const GAP_THRESHOLD: f32 = 0.35;
pub const CROSS_ENCODER_MAX_CHUNKS: usize = 25;
pub const LLM_RERANK_MAX_CHUNKS: usize = 20;
const CROSS_BLEND: f32 = 0.7;

/// Auxiliary cross-encoder scorer seam (sidecar service).
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// One relevance float per candidate text, aligned with input order.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

/// Word-set Jaccard over lowercased words longer than 2 chars.
pub fn jaccard_words(a: &str, b: &str) -> f32 {
    let set = |t: &str| -> HashSet<String> {
        t.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 2)
            .map(|w| w.to_string())
            .collect()
    };
    let sa = set(a);
    let sb = set(b);
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f32;
    let union = (sa.len() + sb.len()) as f32 - inter;
    inter / union
}

enum Similarity {
    Value(f32),
    Duplicate,
}

fn mmr_similarity(candidate: &ScoredChunk, selected: &ScoredChunk) -> Similarity {
    if candidate.chunk.note_id == selected.chunk.note_id {
        return Similarity::Value(SAME_NOTE_SIM);
    }
    if jaccard_words(&candidate.chunk.text, &selected.chunk.text) > NEAR_DUP_JACCARD {
        return Similarity::Duplicate;
    }
    if let (Some(ce), Some(se)) = (
        candidate.chunk.embedding.as_deref(),
        selected.chunk.embedding.as_deref(),
    ) {
        let cos = cosine_similarity(ce, se);
        if cos >= SEMANTIC_DUP_COSINE {
            return Similarity::Duplicate;
        }
        return Similarity::Value(EMBEDDING_SIM_SCALE * cos);
    }
    Similarity::Value(0.0)
}

/// Maximal Marginal Relevance: greedy selection of `top_k` items balancing
/// relevance against similarity to the already-selected set. Near- and
/// semantic duplicates are discarded from the pool outright.
pub fn mmr_select(scored: Vec<ScoredChunk>, top_k: usize, lambda: f32) -> Vec<ScoredChunk> {
    if scored.len() <= 1 {
        return scored;
    }
    let mut pool = scored;
    let mut selected: Vec<ScoredChunk> = Vec::with_capacity(top_k.min(pool.len()));

    while selected.len() < top_k && !pool.is_empty() {
        let mut best: Option<(usize, f32)> = None;
        let mut duplicates: Vec<usize> = Vec::new();

        'pool: for (i, cand) in pool.iter().enumerate() {
            let mut max_sim = 0.0f32;
            for sel in &selected {
                match mmr_similarity(cand, sel) {
                    Similarity::Duplicate => {
                        duplicates.push(i);
                        continue 'pool;
                    }
                    Similarity::Value(s) => max_sim = max_sim.max(s),
                }
            }
            let objective = lambda * cand.combined_score - (1.0 - lambda) * max_sim;
            if best.is_none_or(|(_, b)| objective > b) {
                best = Some((i, objective));
            }
        }

        // Drop duplicates back-to-front so indices stay valid.
        for &i in duplicates.iter().rev() {
            if best.is_some_and(|(b, _)| b == i) {
                best = None;
            }
            pool.remove(i);
            if let Some((b, s)) = best {
                if b > i {
                    best = Some((b - 1, s));
                }
            }
        }

        match best {
            Some((i, _)) if i < pool.len() => selected.push(pool.remove(i)),
            _ if !duplicates.is_empty() => continue,
            _ => break,
        }
    }
    selected
}

/// Precision boost for unique-identifier queries: multiply by
/// `1 + 0.5 × matches` and re-sort.
pub fn uid_boost(mut scored: Vec<ScoredChunk>, uids: &[String]) -> Vec<ScoredChunk> {
    if uids.is_empty() {
        return scored;
    }
    for cand in scored.iter_mut() {
        let text = cand.chunk.text.to_lowercase();
        let matches = uids
            .iter()
            .filter(|uid| text.contains(uid.to_lowercase().as_str()))
            .count();
        if matches > 0 {
            cand.combined_score =
                (cand.combined_score * (1.0 + UID_BOOST_PER_MATCH * matches as f32)).min(1.0);
        }
    }
    sort_by_score(&mut scored);
    scored
}

/// Coverage rerank: guarantee each keyword is represented before filling the
/// rest by score. Only meaningful when the pool is bigger than the cut.
pub fn coverage_rerank(
    scored: Vec<ScoredChunk>,
    keywords: &[String],
    rerank_to: usize,
) -> Vec<ScoredChunk> {
    if scored.len() <= rerank_to || keywords.len() <= 1 {
        return scored;
    }

    let mut picked: Vec<usize> = Vec::new();
    let mut picked_set: HashSet<usize> = HashSet::new();

    for kw in keywords {
        let kw = kw.to_lowercase();
        let hit = scored.iter().enumerate().find(|(i, c)| {
            !picked_set.contains(i) && c.chunk.text.to_lowercase().contains(kw.as_str())
        });
        if let Some((i, _)) = hit {
            picked.push(i);
            picked_set.insert(i);
        }
    }

    let mut out: Vec<ScoredChunk> = picked.iter().map(|&i| scored[i].clone()).collect();
    for (i, c) in scored.into_iter().enumerate() {
        if !picked_set.contains(&i) {
            out.push(c);
        }
    }
    out
}

/// Blend cross-encoder relevance into the head of the list:
/// `0.7·cross + 0.3·original`, then re-sort.
pub fn blend_cross_scores(mut scored: Vec<ScoredChunk>, cross: &[f32]) -> Vec<ScoredChunk> {
    for (cand, &cs) in scored.iter_mut().zip(cross) {
        let cs = cs.clamp(0.0, 1.0);
        cand.cross_score = Some(cs);
        cand.combined_score = CROSS_BLEND * cs + (1.0 - CROSS_BLEND) * cand.combined_score;
    }
    sort_by_score(&mut scored);
    scored
}

/// Parse an LLM reranker's reply into a permutation of `len` items: the
/// first `len` distinct in-range 1-based integers, with absent indices
/// appended in original order.
pub fn parse_rerank_permutation(response: &str, len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = Vec::with_capacity(len);
    let mut seen: HashSet<usize> = HashSet::new();
    let mut current = String::new();

    let push_number = |buf: &mut String, order: &mut Vec<usize>, seen: &mut HashSet<usize>| {
        if buf.is_empty() {
            return;
        }
        if let Ok(n) = buf.parse::<usize>() {
            if n >= 1 && n <= len && seen.insert(n - 1) {
                order.push(n - 1);
            }
        }
        buf.clear();
    };

    for c in response.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            push_number(&mut current, &mut order, &mut seen);
        }
        if order.len() == len {
            break;
        }
    }
    push_number(&mut current, &mut order, &mut seen);

    for i in 0..len {
        if !seen.contains(&i) {
            order.push(i);
        }
    }
    order
}

/// Apply a permutation produced by `parse_rerank_permutation`.
pub fn apply_permutation(scored: Vec<ScoredChunk>, order: &[usize]) -> Vec<ScoredChunk> {
    let mut slots: Vec<Option<ScoredChunk>> = scored.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&i| slots.get_mut(i).and_then(|s| s.take()))
        .collect()
}

/// Post-rerank text dedup: rerankers can reorder near-duplicates next to
/// each other; re-apply the Jaccard threshold keeping first occurrences.
pub fn text_dedup(scored: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let mut kept: Vec<ScoredChunk> = Vec::with_capacity(scored.len());
    for cand in scored {
        let dup = kept
            .iter()
            .any(|k| jaccard_words(&k.chunk.text, &cand.chunk.text) > NEAR_DUP_JACCARD);
        if !dup {
            kept.push(cand);
        }
    }
    kept
}

/// For pointed (non-aggregation) queries with a strong leader, cut the list
/// at the first big consecutive score drop past rank 2.
pub fn score_gap_truncate(mut scored: Vec<ScoredChunk>, intent: Intent) -> Vec<ScoredChunk> {
    if intent.is_aggregation() || scored.len() < 3 {
        return scored;
    }
    if scored[0].combined_score < GAP_TOP_FLOOR {
        return scored;
    }
    for i in 2..scored.len() {
        if scored[i - 1].combined_score - scored[i].combined_score > GAP_THRESHOLD {
            scored.truncate(i);
            break;
        }
    }
    scored
}

pub fn sort_by_score(scored: &mut [ScoredChunk]) {
    // Stable: insertion order breaks ties, keeping retrieval deterministic.
    scored.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Chunk, SourceSet, TERMS_VERSION};
    use chrono::Utc;

    fn sc(id: &str, note: &str, text: &str, score: f32) -> ScoredChunk {
        let mut c = ScoredChunk::unscored(
            Chunk {
                id: id.to_string(),
                note_id: note.to_string(),
                tenant_id: "t".to_string(),
                text: text.to_string(),
                fingerprint: crate::index::chunker::fingerprint(text),
                position: 0,
                total_chunks: 1,
                token_estimate: 1,
                created_at: Utc::now(),
                start_offset: 0,
                end_offset: text.len(),
                anchor: String::new(),
                prev_context: None,
                next_context: None,
                terms: vec![],
                terms_version: TERMS_VERSION.to_string(),
                embedding: None,
                embedding_model: None,
            },
            SourceSet::LEXICAL,
        );
        c.combined_score = score;
        c
    }

    #[test]
    fn jaccard_extremes() {
        assert!((jaccard_words("alpha beta gamma", "alpha beta gamma") - 1.0).abs() < 1e-6);
        assert_eq!(jaccard_words("alpha beta", "delta epsilon"), 0.0);
        assert_eq!(jaccard_words("", "anything here"), 0.0);
    }

    #[test]
    fn mmr_downranks_same_note_neighbors() {
        let scored = vec![
            sc("n1_000", "n1", "database migration plan for the quarter", 0.9),
            sc("n1_001", "n1", "database migration continued details here", 0.85),
            sc("n2_000", "n2", "totally different topic about gardening", 0.6),
        ];
        let out = mmr_select(scored, 2, 0.65);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk.id, "n1_000");
        // Diversity pulls in the other note despite the lower raw score.
        assert_eq!(out[1].chunk.id, "n2_000");
    }

    #[test]
    fn mmr_discards_near_duplicates() {
        let scored = vec![
            sc("n1_000", "n1", "the quarterly budget was approved today", 0.9),
            sc("n2_000", "n2", "the quarterly budget was approved today", 0.8),
            sc("n3_000", "n3", "unrelated discussion of release schedule", 0.5),
        ];
        let out = mmr_select(scored, 3, 0.65);
        let ids: Vec<&str> = out.iter().map(|c| c.chunk.id.as_str()).collect();
        assert!(ids.contains(&"n1_000"));
        assert!(!ids.contains(&"n2_000"), "duplicate should be discarded");
        assert!(ids.contains(&"n3_000"));
    }

    #[test]
    fn uid_boost_reorders() {
        let scored = vec![
            sc("a_000", "a", "general notes about testing", 0.8),
            sc("b_000", "b", "the CITE_TEST_002 incident report", 0.7),
        ];
        let out = uid_boost(scored, &["cite_test_002".to_string()]);
        assert_eq!(out[0].chunk.id, "b_000");
        assert!((out[0].combined_score - (0.7 * 1.5)).abs() < 1e-6);
    }

    #[test]
    fn coverage_guarantees_keyword_representation() {
        let scored = vec![
            sc("a_000", "a", "all about postgres tuning", 0.9),
            sc("b_000", "b", "more postgres tuning notes", 0.8),
            sc("c_000", "c", "kafka consumer lag investigation", 0.2),
        ];
        let out = coverage_rerank(
            scored,
            &["postgres".to_string(), "kafka".to_string()],
            2,
        );
        let head: Vec<&str> = out.iter().take(2).map(|c| c.chunk.id.as_str()).collect();
        assert!(head.contains(&"a_000"));
        assert!(head.contains(&"c_000"), "kafka chunk must be covered");
    }

    #[test]
    fn cross_blend_mixes_scores() {
        let scored = vec![sc("a_000", "a", "x", 0.5), sc("b_000", "b", "y", 0.9)];
        let out = blend_cross_scores(scored, &[0.95, 0.1]);
        assert_eq!(out[0].chunk.id, "a_000");
        assert!((out[0].combined_score - (0.7 * 0.95 + 0.3 * 0.5)).abs() < 1e-6);
        assert_eq!(out[0].cross_score, Some(0.95));
    }

    #[test]
    fn permutation_parse_fills_missing() {
        let order = parse_rerank_permutation("Ranking: 3, 1, then 3 again, done", 4);
        assert_eq!(order, vec![2, 0, 1, 3]);
        let order = parse_rerank_permutation("no numbers at all", 3);
        assert_eq!(order, vec![0, 1, 2]);
        // Out-of-range indices are ignored.
        let order = parse_rerank_permutation("9 2 1", 2);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn gap_truncation_only_for_pointed_intents() {
        let scored = vec![
            sc("a_000", "a", "x", 0.9),
            sc("b_000", "b", "y", 0.85),
            sc("c_000", "c", "z", 0.8),
            sc("d_000", "d", "w", 0.2),
        ];
        let cut = score_gap_truncate(scored.clone(), Intent::Question);
        assert_eq!(cut.len(), 3);

        let kept = score_gap_truncate(scored, Intent::Summarize);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn gap_truncation_never_cuts_top_two() {
        let scored = vec![
            sc("a_000", "a", "x", 0.9),
            sc("b_000", "b", "y", 0.3),
            sc("c_000", "c", "z", 0.25),
        ];
        let out = score_gap_truncate(scored, Intent::Question);
        assert_eq!(out.len(), 3, "gap between ranks 1 and 2 must not truncate");
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let scored = vec![
            sc("a_000", "a", "identical content words here", 0.9),
            sc("b_000", "b", "identical content words here", 0.8),
        ];
        let out = text_dedup(scored);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk.id, "a_000");
    }
}
