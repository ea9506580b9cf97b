//! Post-generation citation validation and optional claim anchoring.
//!
//! Token-level checks always run on the raw (pre-normalization) answer
//! buffer; the token regex recognizes both the `[N3]` wire form and the
//! `[3]` client-display form so validation is robust to either.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::answer::source_pack::SourcePack;
use crate::core::types::Citation;
use crate::index::chunker::extract_terms;

static CITATION_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[N?(\d+)\]").unwrap());
static SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// Result of the token-level pass.
#[derive(Debug, Clone, Default)]
pub struct CitationValidation {
    /// Distinct valid tokens in order of first appearance (canonical `N<i>`).
    pub cited: Vec<String>,
    /// Tokens outside `[1, source_count]`: contract violations.
    pub invalid: Vec<String>,
    /// `|cited| / source_count`.
    pub coverage: f64,
}

/// Every citation index appearing in the answer, in order, duplicates kept.
pub fn extract_citation_ids(answer: &str) -> Vec<u32> {
    CITATION_TOKEN
        .captures_iter(answer)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Token-level validation against the pack.
pub fn validate_citations(answer: &str, pack: &SourcePack) -> CitationValidation {
    let mut cited: Vec<String> = Vec::new();
    let mut invalid: Vec<String> = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();

    for idx in extract_citation_ids(answer) {
        if !seen.insert(idx) {
            continue;
        }
        let token = format!("N{}", idx);
        if pack.contains(&token) {
            cited.push(token);
        } else {
            invalid.push(token);
        }
    }

    let coverage = if pack.source_count() == 0 {
        0.0
    } else {
        cited.len() as f64 / pack.source_count() as f64
    };
    CitationValidation {
        cited,
        invalid,
        coverage,
    }
}

/// Remove citation tokens that do not exist in the pack. Run after the
/// single repair attempt; what remains is contract-clean.
pub fn strip_invalid_tokens(answer: &str, pack: &SourcePack) -> String {
    CITATION_TOKEN
        .replace_all(answer, |caps: &regex::Captures| {
            let token = format!("N{}", &caps[1]);
            if pack.contains(&token) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .to_string()
}

/// The citations array for the response: unique, ordered by first use in the
/// answer.
pub fn citations_in_order(answer: &str, pack: &SourcePack) -> Vec<Citation> {
    let mut out = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();
    for idx in extract_citation_ids(answer) {
        if !seen.insert(idx) {
            continue;
        }
        if let Some(entry) = pack.get(&format!("N{}", idx)) {
            out.push(entry.citation.clone());
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Claim anchoring (optional layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Factual,
    Definitional,
    Procedural,
    Opinion,
}

static DEFINITIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(is defined as|means|refers to|is a kind of)\b").unwrap());
static PROCEDURAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(first|then|next|step \d|how to|followed by)\b").unwrap());
static OPINION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i think|i feel|i believe|probably|perhaps|in my opinion|seems like)\b")
        .unwrap()
});

fn classify_claim(sentence: &str) -> ClaimKind {
    if DEFINITIONAL.is_match(sentence) {
        ClaimKind::Definitional
    } else if PROCEDURAL.is_match(sentence) {
        ClaimKind::Procedural
    } else if OPINION.is_match(sentence) {
        ClaimKind::Opinion
    } else {
        ClaimKind::Factual
    }
}

/// One flagged claim: a cited sentence whose excerpt may not support it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimFlag {
    pub sentence: String,
    pub token: String,
    pub overlap: f32,
    pub kind: ClaimKind,
    /// Better-supported pack token, when one exists.
    pub suggested_token: Option<String>,
}

fn word_set(text: &str) -> HashSet<String> {
    extract_terms(text).into_iter().collect()
}

fn jaccard_full(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = (a.len() + b.len()) as f32 - inter;
    inter / union
}

/// Claim-level anchoring: for each sentence carrying citations, check that
/// the cited excerpt lexically supports it. Flags fire below half of the
/// semantic-match threshold; each flag suggests the best replacement by
/// `0.3·keyword-overlap + 0.7·relevance`, considering only pack entries with
/// at least `min_overlap` keyword overlap.
pub fn anchor_claims(
    answer: &str,
    pack: &SourcePack,
    semantic_match_threshold: f32,
    min_overlap: f32,
) -> Vec<ClaimFlag> {
    let flag_below = semantic_match_threshold * 0.5;
    let mut flags = Vec::new();

    let mut sentences: Vec<&str> = Vec::new();
    let mut cursor = 0;
    for m in SENTENCE_BOUNDARY.find_iter(answer) {
        sentences.push(&answer[cursor..m.start() + 1]);
        cursor = m.end();
    }
    if cursor < answer.len() {
        sentences.push(&answer[cursor..]);
    }

    for sentence in sentences {
        let ids: Vec<u32> = extract_citation_ids(sentence);
        if ids.is_empty() {
            continue;
        }
        let claim_words = word_set(sentence);
        if claim_words.is_empty() {
            continue;
        }

        for idx in ids {
            let token = format!("N{}", idx);
            let Some(entry) = pack.get(&token) else {
                continue;
            };
            let overlap = jaccard_full(&claim_words, &word_set(&entry.text));
            if overlap >= flag_below {
                continue;
            }

            // Best replacement across the pack.
            let suggested_token = pack
                .entries()
                .iter()
                .filter(|e| e.token != token)
                .filter_map(|e| {
                    let kw_overlap = jaccard_full(&claim_words, &word_set(&e.text));
                    if kw_overlap < min_overlap {
                        return None;
                    }
                    let blended = 0.3 * kw_overlap + 0.7 * e.citation.score as f32;
                    Some((blended, e.token.clone()))
                })
                .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(_, t)| t);

            flags.push(ClaimFlag {
                sentence: sentence.trim().to_string(),
                token,
                overlap,
                kind: classify_claim(sentence),
                suggested_token,
            });
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::source_pack::build_source_pack;
    use crate::core::types::{Chunk, ScoredChunk, SourceSet, TERMS_VERSION};
    use chrono::Utc;

    fn pack(texts: &[(&str, f32)]) -> SourcePack {
        let chunks: Vec<ScoredChunk> = texts
            .iter()
            .enumerate()
            .map(|(i, (t, score))| {
                let mut c = ScoredChunk::unscored(
                    Chunk {
                        id: format!("n{}_000", i),
                        note_id: format!("n{}", i),
                        tenant_id: "t".to_string(),
                        text: t.to_string(),
                        fingerprint: crate::index::chunker::fingerprint(t),
                        position: 0,
                        total_chunks: 1,
                        token_estimate: 1,
                        created_at: Utc::now(),
                        start_offset: 0,
                        end_offset: t.len(),
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
                c.combined_score = *score;
                c
            })
            .collect();
        build_source_pack(&chunks, 250)
    }

    #[test]
    fn both_token_forms_are_recognized() {
        assert_eq!(extract_citation_ids("claim [N1] and [2] and [N3]"), vec![1, 2, 3]);
        assert!(extract_citation_ids("no tokens [Nx] [ ] here").is_empty());
    }

    #[test]
    fn validation_separates_valid_and_invalid() {
        let p = pack(&[("alpha", 0.9), ("beta", 0.8)]);
        let v = validate_citations("uses [N1] twice [N1], then [N2] and bogus [N7]", &p);
        assert_eq!(v.cited, vec!["N1", "N2"]);
        assert_eq!(v.invalid, vec!["N7"]);
        assert!((v.coverage - 1.0).abs() < 1e-9);
    }

    #[test]
    fn coverage_is_fraction_of_pack() {
        let p = pack(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6)]);
        let v = validate_citations("only [N1]", &p);
        assert!((v.coverage - 0.25).abs() < 1e-9);
    }

    #[test]
    fn strip_removes_only_out_of_pack_tokens() {
        let p = pack(&[("a", 0.9)]);
        let cleaned = strip_invalid_tokens("keep [N1] drop [N9] and [4]", &p);
        assert_eq!(cleaned, "keep [N1] drop  and ");
    }

    #[test]
    fn citations_come_back_in_first_use_order() {
        let p = pack(&[("a", 0.9), ("b", 0.8), ("c", 0.7)]);
        let citations = citations_in_order("see [N3], then [N1], then [N3] again", &p);
        let cids: Vec<&str> = citations.iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(cids, vec!["N3", "N1"]);
    }

    #[test]
    fn unsupported_claims_are_flagged_with_suggestion() {
        let p = pack(&[
            ("the team picked PostgreSQL for the storage layer", 0.9),
            ("lunch menu had sandwiches and soup on tuesday", 0.2),
        ]);
        // Claim cites N2 but talks about the database decision.
        let flags = anchor_claims(
            "The team selected PostgreSQL for storage [N2].",
            &p,
            0.65,
            0.15,
        );
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].token, "N2");
        assert_eq!(flags[0].suggested_token.as_deref(), Some("N1"));
        assert_eq!(flags[0].kind, ClaimKind::Factual);
    }

    #[test]
    fn supported_claims_are_not_flagged() {
        let p = pack(&[("the team picked postgresql for the storage layer", 0.9)]);
        let flags = anchor_claims(
            "The team picked postgresql for the storage layer [N1].",
            &p,
            0.65,
            0.15,
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn opinion_cues_change_claim_kind() {
        let p = pack(&[("completely unrelated text about gardening tulips", 0.9)]);
        let flags = anchor_claims("I think the budget was probably fine [N1].", &p, 0.65, 0.15);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, ClaimKind::Opinion);
    }
}
