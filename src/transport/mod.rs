//! Server-sent event envelope for streaming answers, plus the stream-side
//! citation normalizer (`[N3]` → `[3]` for client display).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::answer::source_pack::SourcePack;

/// Heartbeat cadence on open streams.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
/// Cap on retrieved-but-uncited notes surfaced as context.
pub const CONTEXT_SOURCES_MAX: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

impl Confidence {
    /// Derived from how many pack sources the answer actually cited.
    pub fn from_counts(source_count: usize, cited_count: usize) -> Self {
        if source_count == 0 {
            Confidence::None
        } else if cited_count >= 3 {
            Confidence::High
        } else if cited_count >= 1 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub id: String,
    pub note_id: String,
    pub preview: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSource {
    pub note_id: String,
    pub preview: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneMeta {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub response_time_ms: u64,
    pub confidence: Confidence,
    pub source_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_source_count: Option<usize>,
}

/// One streamed envelope. Each serializes to a single `data: <json>\n\n`
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Sources { sources: Vec<SourceSummary> },
    ContextSources { sources: Vec<ContextSource> },
    Token { content: String },
    Heartbeat { seq: u64 },
    Followups { suggestions: Vec<String> },
    Done { meta: DoneMeta },
    Error { error: String },
}

impl StreamEvent {
    /// Wire encoding: one SSE data frame.
    pub fn to_frame(&self) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
        )
    }
}

/// The `sources` event body for a pack, ordered by token.
pub fn sources_event(pack: &SourcePack) -> StreamEvent {
    StreamEvent::Sources {
        sources: pack
            .entries()
            .iter()
            .map(|e| SourceSummary {
                id: e.token.clone(),
                note_id: e.citation.note_id.clone(),
                preview: e.citation.snippet.clone(),
                date: e.citation.created_at.clone(),
                start_offset: e.citation.start_offset,
                end_offset: e.citation.end_offset,
                anchor: e.citation.anchor.clone(),
            })
            .collect(),
    }
}

static WIRE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[N(\d+)\]").unwrap());

/// Stream-side display normalizer: rewrites `[N<d>]` to `[<d>]` across
/// arbitrary chunk boundaries by carrying a possible token prefix between
/// feeds. The raw text must be accumulated separately for validation; never
/// validate the normalized form.
#[derive(Debug, Default)]
pub struct CitationNormalizer {
    carry: String,
}

impl CitationNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one model chunk; returns display-safe normalized text. Output
    /// may lag input by a few characters when a chunk ends mid-token.
    pub fn feed(&mut self, chunk: &str) -> String {
        let combined = format!("{}{}", self.carry, chunk);

        // Hold back a trailing prefix that could still become `[N<d>]`.
        let holdback = Self::partial_token_start(&combined);
        let (safe, rest) = combined.split_at(holdback);
        self.carry = rest.to_string();
        WIRE_TOKEN.replace_all(safe, "[$1]").to_string()
    }

    /// Flush whatever is held back, normalizing completed tokens.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        WIRE_TOKEN.replace_all(&rest, "[$1]").to_string()
    }

    /// Byte index where a trailing partial citation token begins, or the
    /// string length when the tail is safe to emit.
    fn partial_token_start(text: &str) -> usize {
        let Some(open) = text.rfind('[') else {
            return text.len();
        };
        let tail = &text[open..];
        if tail.contains(']') {
            return text.len();
        }
        // `[`, `[N`, `[N12`, `[7` are all viable prefixes of a token.
        let mut chars = tail.chars().skip(1);
        match chars.next() {
            None => open,
            Some('N') => {
                if chars.all(|c| c.is_ascii_digit()) {
                    open
                } else {
                    text.len()
                }
            }
            Some(c) if c.is_ascii_digit() => {
                if chars.all(|c| c.is_ascii_digit()) {
                    open
                } else {
                    text.len()
                }
            }
            Some(_) => text.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_single_data_lines() {
        let frame = StreamEvent::Heartbeat { seq: 3 }.to_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["seq"], 3);
    }

    #[test]
    fn event_types_serialize_with_snake_case_tags() {
        let done = StreamEvent::Done {
            meta: DoneMeta {
                model: "m".into(),
                request_id: None,
                response_time_ms: 10,
                confidence: Confidence::High,
                source_count: 4,
                context_source_count: Some(2),
            },
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["meta"]["confidence"], "high");
        assert_eq!(json["meta"]["sourceCount"], 4);
    }

    #[test]
    fn normalizer_rewrites_whole_tokens() {
        let mut n = CitationNormalizer::new();
        let out = format!("{}{}", n.feed("claim [N1] and [N12]."), n.finish());
        assert_eq!(out, "claim [1] and [12].");
    }

    #[test]
    fn normalizer_handles_tokens_split_across_chunks() {
        let mut n = CitationNormalizer::new();
        let mut out = String::new();
        for piece in ["claim [", "N", "1", "] done [N", "2]"] {
            out.push_str(&n.feed(piece));
        }
        out.push_str(&n.finish());
        assert_eq!(out, "claim [1] done [2]");
    }

    #[test]
    fn normalizer_leaves_plain_brackets_alone() {
        let mut n = CitationNormalizer::new();
        let out = format!("{}{}", n.feed("array[Na] and [note] stay"), n.finish());
        assert_eq!(out, "array[Na] and [note] stay");
    }

    #[test]
    fn normalizer_flushes_incomplete_token_on_finish() {
        let mut n = CitationNormalizer::new();
        let mut out = n.feed("ends with [N4");
        out.push_str(&n.finish());
        assert_eq!(out, "ends with [N4");
    }

    #[test]
    fn confidence_ladder() {
        assert_eq!(Confidence::from_counts(0, 0), Confidence::None);
        assert_eq!(Confidence::from_counts(5, 0), Confidence::Low);
        assert_eq!(Confidence::from_counts(5, 2), Confidence::Medium);
        assert_eq!(Confidence::from_counts(5, 3), Confidence::High);
    }
}
