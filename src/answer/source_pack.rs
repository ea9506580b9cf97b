//! The source pack: a one-to-one map from citation token to source record.
//! This is the single source of truth for which citations the generator may
//! emit: the pack's size equals both the number of sources in the prompt
//! and the highest legal token index.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::types::{Citation, ScoredChunk};

static SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// One pack entry: the wire citation plus the full text the prompt carries.
#[derive(Debug, Clone)]
pub struct PackEntry {
    pub token: String,
    pub citation: Citation,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SourcePack {
    entries: Vec<PackEntry>,
}

impl SourcePack {
    pub fn source_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PackEntry] {
        &self.entries
    }

    /// Look up a token of the form `N<i>`; valid iff `1 <= i <= len`.
    pub fn get(&self, token: &str) -> Option<&PackEntry> {
        let index: usize = token.strip_prefix('N')?.parse().ok()?;
        if index == 0 {
            return None;
        }
        self.entries.get(index - 1)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.get(token).is_some()
    }
}

/// Build the pack from the final chunk list. No filtering happens here: the
/// pack size must equal the chunk list length so `N<source_count>` is the
/// largest legal token.
pub fn build_source_pack(chunks: &[ScoredChunk], snippet_max_chars: usize) -> SourcePack {
    let entries = chunks
        .iter()
        .enumerate()
        .map(|(i, sc)| {
            let token = format!("N{}", i + 1);
            let citation = Citation {
                cid: token.clone(),
                note_id: sc.chunk.note_id.clone(),
                chunk_id: sc.chunk.id.clone(),
                created_at: sc
                    .chunk
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                snippet: extract_best_snippet(&sc.chunk.text, snippet_max_chars),
                score: round2(sc.combined_score as f64),
                start_offset: Some(sc.chunk.start_offset),
                end_offset: Some(sc.chunk.end_offset),
                anchor: Some(sc.chunk.anchor.clone()),
            };
            PackEntry {
                token,
                citation,
                text: sc.chunk.text.clone(),
                created_at: sc.chunk.created_at,
            }
        })
        .collect();
    SourcePack { entries }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Sentence-aligned snippet: verbatim when short enough, else whole
/// sentences while they fit, else a word-boundary cut with an ellipsis.
pub fn extract_best_snippet(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }

    let mut out = String::new();
    let mut cursor = 0;
    for m in SENTENCE_SPLIT.find_iter(text) {
        let sentence_end = m.start() + 1;
        let candidate = &text[cursor..sentence_end];
        if out.len() + candidate.len() + 1 > max_len {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(candidate.trim());
        cursor = m.end();
    }
    if !out.is_empty() {
        return out;
    }

    // No sentence fits: cut at the last word boundary past 70% of the cap.
    let floor = (max_len as f64 * 0.7) as usize;
    let mut cut = max_len.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = &text[..cut];
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(at) if at >= floor => at,
        _ => cut,
    };
    format!("{}...", text[..cut].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Chunk, SourceSet, TERMS_VERSION};

    fn sc(id: &str, text: &str, score: f32) -> ScoredChunk {
        let mut c = ScoredChunk::unscored(
            Chunk {
                id: id.to_string(),
                note_id: id.split('_').next().unwrap().to_string(),
                tenant_id: "t".to_string(),
                text: text.to_string(),
                fingerprint: crate::index::chunker::fingerprint(text),
                position: 0,
                total_chunks: 1,
                token_estimate: 1,
                created_at: Utc::now(),
                start_offset: 0,
                end_offset: text.len(),
                anchor: text.chars().take(50).collect(),
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
    fn pack_is_one_to_one_with_chunks() {
        let chunks = vec![sc("a_000", "First source.", 0.91234), sc("b_000", "Second source.", 0.5)];
        let pack = build_source_pack(&chunks, 250);
        assert_eq!(pack.source_count(), 2);
        assert!(pack.contains("N1"));
        assert!(pack.contains("N2"));
        assert!(!pack.contains("N3"));
        assert!(!pack.contains("N0"));
        assert_eq!(pack.get("N1").unwrap().citation.chunk_id, "a_000");
        // Scores round to 2 decimals.
        assert_eq!(pack.get("N1").unwrap().citation.score, 0.91);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let pack = build_source_pack(&[sc("a_000", "text", 0.5)], 250);
        assert!(!pack.contains("1"));
        assert!(!pack.contains("Nx"));
        assert!(!pack.contains("N"));
        assert!(!pack.contains(""));
    }

    #[test]
    fn snippet_verbatim_when_short() {
        assert_eq!(extract_best_snippet("Short text.", 250), "Short text.");
    }

    #[test]
    fn snippet_accumulates_whole_sentences() {
        let text = "First sentence here. Second sentence follows. Third one is way too long to fit in the remaining budget at all.";
        let snippet = extract_best_snippet(text, 50);
        assert_eq!(snippet, "First sentence here. Second sentence follows.");
    }

    #[test]
    fn snippet_word_boundary_fallback_adds_ellipsis() {
        let text = "onelongrun ".repeat(40);
        let snippet = extract_best_snippet(text.trim(), 50);
        assert!(snippet.ends_with("..."));
        assert!(snippet.len() <= 54);
        assert!(!snippet.contains("onelongru "), "must cut at word boundary");
    }

    #[test]
    fn citation_dates_are_iso8601() {
        let pack = build_source_pack(&[sc("a_000", "text", 0.5)], 250);
        let created = &pack.get("N1").unwrap().citation.created_at;
        assert!(created.contains('T'));
        assert!(created.ends_with('Z'));
    }
}
