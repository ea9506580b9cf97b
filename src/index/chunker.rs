//! Note chunking: overlapping, boundary-aware text splitting with exact
//! source offsets, plus per-chunk lexical term extraction and content
//! fingerprints.
//!
//! Chunks are contiguous spans of the normalized note text, so
//! `text == note_text[start_offset..end_offset]` holds exactly; the overlap
//! window makes consecutive spans overlap by up to `CHUNK_OVERLAP` characters.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::core::config::ChunkConfig;
use crate::core::types::{Chunk, TERMS_VERSION};

/// Characters of leading chunk text kept as the anchor string.
const ANCHOR_LEN: usize = 50;
/// Characters of adjacent-chunk text carried as prev/next context.
const CONTEXT_LEN: usize = 100;
/// Window around the target size searched for a forced-split boundary.
const SPLIT_WINDOW: usize = 100;

static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n+").unwrap());
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
        "one", "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now",
        "old", "see", "two", "way", "who", "did", "get", "got", "let", "she", "too", "use",
        "that", "this", "with", "from", "they", "will", "would", "there", "their", "what",
        "about", "which", "when", "were", "your", "said", "each", "them", "than", "then",
        "some", "could", "into", "very", "just", "been", "over", "also", "only", "most",
        "other", "after", "before", "because", "these", "those", "such", "more", "does",
        "doing", "should", "here",
    ]
    .into_iter()
    .collect()
});

/// CRLF → LF plus outer trim. Idempotent.
pub fn normalize_note_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

/// Truncated content hash: first 16 hex chars of SHA-256. The unit of chunk
/// idempotence: equal text yields equal fingerprints across re-indexing.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Lowercased, deduplicated content words of length >= 3, stopwords removed,
/// first-occurrence order preserved.
pub fn extract_terms(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();

    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for token in cleaned.split_whitespace() {
        if token.len() < 3 || STOPWORDS.contains(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            terms.push(token.to_string());
        }
    }
    terms
}

/// A split span before it becomes a persisted chunk document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub anchor: String,
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

fn snap_to_char_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn skip_leading_whitespace(text: &str, mut pos: usize) -> usize {
    while pos < text.len() {
        let rest = &text[pos..];
        match rest.chars().next() {
            Some(c) if c.is_whitespace() => pos += c.len_utf8(),
            _ => break,
        }
    }
    pos
}

/// Semantic units of the text: paragraphs, with oversized paragraphs further
/// split at sentence terminators. Returned as byte spans into `text`.
fn semantic_units(text: &str, target_size: usize) -> Vec<(usize, usize)> {
    let mut paragraphs: Vec<(usize, usize)> = Vec::new();
    let mut cursor = 0;
    for sep in BLANK_LINES.find_iter(text) {
        if sep.start() > cursor {
            paragraphs.push((cursor, sep.start()));
        }
        cursor = sep.end();
    }
    if cursor < text.len() {
        paragraphs.push((cursor, text.len()));
    }

    let mut units = Vec::new();
    for (ps, pe) in paragraphs {
        if pe - ps <= target_size {
            units.push((ps, pe));
            continue;
        }
        // Oversized paragraph: break at sentence terminators.
        let para = &text[ps..pe];
        let mut sentence_start = 0;
        for m in SENTENCE_END.find_iter(para) {
            let sentence_end = m.start() + 1; // keep the terminator
            if sentence_end > sentence_start {
                units.push((ps + sentence_start, ps + sentence_end));
            }
            sentence_start = skip_leading_whitespace(para, m.start() + 1);
        }
        if sentence_start < para.len() {
            units.push((ps + sentence_start, pe));
        }
    }
    units
}

/// Where the overlap context for the next chunk begins inside the span
/// `[start, end)`: at most `overlap` characters back from `end`, snapped
/// forward to the nearest sentence boundary, else word boundary.
fn overlap_start(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    let window_start = snap_to_char_boundary(text, end.saturating_sub(overlap).max(start));
    let window = &text[window_start..end];

    if let Some(m) = SENTENCE_END.find_iter(window).last() {
        return skip_leading_whitespace(text, window_start + m.end());
    }
    if let Some(idx) = window.rfind(char::is_whitespace) {
        return skip_leading_whitespace(text, window_start + idx);
    }
    window_start
}

/// Best forced-split position inside `[start, end)`, near `start + target`:
/// sentence end, else clause end, else last space, within the split window.
fn best_split(text: &str, start: usize, end: usize, target: usize) -> usize {
    let ideal = snap_to_char_boundary(text, (start + target).min(end.saturating_sub(1)));
    let lo = snap_to_char_boundary(text, ideal.saturating_sub(SPLIT_WINDOW).max(start + 1));
    let hi = snap_to_char_boundary(text, (ideal + SPLIT_WINDOW).min(end.saturating_sub(1)));
    if lo >= hi {
        return ideal.max(start + 1);
    }
    let window = &text[lo..hi];

    if let Some(m) = SENTENCE_END.find_iter(window).last() {
        return lo + m.start() + 1;
    }
    static CLAUSE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;:]\s").unwrap());
    if let Some(m) = CLAUSE_END.find_iter(window).last() {
        return lo + m.start() + 1;
    }
    if let Some(idx) = window.rfind(char::is_whitespace) {
        return lo + idx;
    }
    ideal.max(start + 1)
}

/// Split normalized note text into overlapping spans honoring the size policy.
pub fn split_into_chunks(text: &str, cfg: &ChunkConfig) -> Vec<RawChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if text.len() <= cfg.max_size {
        return vec![span_to_raw(text, 0, text.len())];
    }

    let units = semantic_units(text, cfg.target_size);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut cur: Option<(usize, usize)> = None;

    for &(us, ue) in &units {
        cur = match cur {
            None => Some((us, ue)),
            Some((cs, ce)) => {
                if ue.saturating_sub(cs) <= cfg.max_size {
                    Some((cs, ue))
                } else if ce - cs >= cfg.min_size {
                    spans.push((cs, ce));
                    let os = overlap_start(text, cs, ce, cfg.overlap);
                    Some((os, ue))
                } else {
                    // Below min size but the unit would overflow: force-add,
                    // then let the carve loop split near the target.
                    Some((cs, ue))
                }
            }
        };
        // A single oversized unit (or a forced add) can leave the current
        // span past max size; carve it down at the best boundaries.
        while let Some((s, e)) = cur {
            if e - s <= cfg.max_size {
                break;
            }
            let sp = best_split(text, s, e, cfg.target_size);
            spans.push((s, sp));
            cur = Some((skip_leading_whitespace(text, sp), e));
        }
    }

    if let Some((cs, ce)) = cur {
        let remainder_len = ce - cs;
        match spans.last_mut() {
            Some(last) if remainder_len < cfg.min_size && ce - last.0 <= cfg.max_size => {
                // Small trailing remainder folds into the previous chunk.
                last.1 = ce;
            }
            _ => spans.push((cs, ce)),
        }
    }

    spans
        .into_iter()
        .filter(|(s, e)| !text[*s..*e].trim().is_empty())
        .map(|(s, e)| span_to_raw(text, s, e))
        .collect()
}

fn span_to_raw(text: &str, start: usize, end: usize) -> RawChunk {
    let chunk_text = text[start..end].to_string();
    let anchor = take_chars(&chunk_text, ANCHOR_LEN);
    RawChunk {
        text: chunk_text,
        start_offset: start,
        end_offset: end,
        anchor,
    }
}

/// Full chunk assembly for one note: split, fingerprint, extract terms, and
/// attach adjacency context. Embeddings are attached later by the indexer.
pub fn assemble_note_chunks(
    note_id: &str,
    tenant_id: &str,
    created_at: DateTime<Utc>,
    normalized_text: &str,
    cfg: &ChunkConfig,
) -> Vec<Chunk> {
    let raw = split_into_chunks(normalized_text, cfg);
    let total = raw.len() as u32;

    let mut chunks: Vec<Chunk> = raw
        .iter()
        .enumerate()
        .map(|(i, r)| Chunk {
            id: Chunk::make_id(note_id, i as u32),
            note_id: note_id.to_string(),
            tenant_id: tenant_id.to_string(),
            fingerprint: fingerprint(&r.text),
            token_estimate: (r.text.len() as u32 / 4).max(1),
            position: i as u32,
            total_chunks: total,
            created_at,
            start_offset: r.start_offset,
            end_offset: r.end_offset,
            anchor: r.anchor.clone(),
            prev_context: None,
            next_context: None,
            terms: extract_terms(&r.text),
            terms_version: TERMS_VERSION.to_string(),
            embedding: None,
            embedding_model: None,
            text: r.text.clone(),
        })
        .collect();

    for i in 0..chunks.len() {
        if i > 0 {
            chunks[i].prev_context = Some(tail_chars(&chunks[i - 1].text, CONTEXT_LEN));
        }
        if i + 1 < chunks.len() {
            chunks[i].next_context = Some(take_chars(&chunks[i + 1].text, CONTEXT_LEN));
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ChunkConfig {
        ChunkConfig {
            target_size: 450,
            min_size: 80,
            max_size: 700,
            overlap: 75,
        }
    }

    fn para(word: &str, n: usize) -> String {
        std::iter::repeat(format!("{} sentence filler words here.", word))
            .take(n)
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_into_chunks("", &cfg()).is_empty());
        assert!(split_into_chunks("   \n  ", &cfg()).is_empty());
    }

    #[test]
    fn short_text_is_a_single_full_span() {
        let text = "Budget is $50,000.";
        let chunks = split_into_chunks(text, &cfg());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 18);
    }

    #[test]
    fn chunk_text_equals_source_slice() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            para("alpha", 8),
            para("beta", 8),
            para("gamma", 8)
        );
        let chunks = split_into_chunks(&text, &cfg());
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.text, &text[c.start_offset..c.end_offset]);
            assert!(c.start_offset < c.end_offset);
        }
    }

    #[test]
    fn sizes_respect_bounds_for_multichunk_notes() {
        let text = format!("{}\n\n{}", para("alpha", 15), para("beta", 15));
        let chunks = split_into_chunks(&text, &cfg());
        assert!(chunks.len() > 1);
        let c = cfg();
        for chunk in &chunks {
            assert!(
                chunk.text.len() <= c.max_size,
                "chunk over max: {}",
                chunk.text.len()
            );
        }
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                chunk.text.len() >= c.min_size,
                "non-final chunk under min: {}",
                chunk.text.len()
            );
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = para("words", 60);
        let chunks = split_into_chunks(&text, &cfg());
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start_offset < pair[0].end_offset,
                "expected overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn fingerprint_is_stable_and_16_hex() {
        let a = fingerprint("hello world");
        let b = fingerprint("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fingerprint("hello worlds"), a);
    }

    #[test]
    fn term_extraction_filters_and_dedupes() {
        let terms = extract_terms("The Budget budget is $50,000 for PROJECT_ALPHA and the team");
        assert!(terms.contains(&"budget".to_string()));
        assert!(terms.contains(&"project_alpha".to_string()));
        assert!(terms.contains(&"team".to_string()));
        assert!(!terms.contains(&"the".to_string()));
        assert!(!terms.contains(&"is".to_string()));
        assert_eq!(
            terms.iter().filter(|t| t.as_str() == "budget").count(),
            1,
            "terms must be deduplicated"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = "  line one\r\nline two\r\n";
        let once = normalize_note_text(raw);
        assert_eq!(once, "line one\nline two");
        assert_eq!(normalize_note_text(&once), once);
    }

    #[test]
    fn assembled_chunks_have_stable_ids_and_context() {
        let now = Utc::now();
        let text = normalize_note_text(&format!("{}\n\n{}", para("alpha", 12), para("beta", 12)));
        let a = assemble_note_chunks("n1", "t1", now, &text, &cfg());
        let b = assemble_note_chunks("n1", "t1", now, &text, &cfg());
        assert!(a.len() > 1);
        assert_eq!(
            a.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            b.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
        );
        assert_eq!(
            a.iter().map(|c| c.fingerprint.clone()).collect::<Vec<_>>(),
            b.iter().map(|c| c.fingerprint.clone()).collect::<Vec<_>>()
        );
        assert_eq!(a[0].id, "n1_000");
        assert!(a[0].prev_context.is_none());
        assert!(a[0].next_context.is_some());
        assert!(a.last().unwrap().next_context.is_none());
        for c in &a {
            assert_eq!(c.total_chunks, a.len() as u32);
            assert_eq!(c.terms_version, TERMS_VERSION);
        }
    }

    #[test]
    fn giant_unbroken_sentence_is_force_split() {
        let text = "word ".repeat(400);
        let text = text.trim();
        let chunks = split_into_chunks(text, &cfg());
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= cfg().max_size);
            assert_eq!(c.text, &text[c.start_offset..c.end_offset]);
        }
    }
}
