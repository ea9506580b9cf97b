//! Rule-based query analysis: intent classification, keyword extraction,
//! time-window inference, entity detection. Deterministic: the same query
//! always produces the same analysis.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::types::{Intent, QueryAnalysis};
use crate::index::chunker::extract_terms;

/// Hard cap on analyzed query length.
const QUERY_MAX_CHARS: usize = 500;
const ENTITY_MAX: usize = 5;
const BOOST_TERMS_MAX: usize = 18;

// Intent tables are ordered and first-match wins. Decision patterns run
// before the generic interrogative check so "what did I decide" classifies
// as decision, not question.
static SUMMARIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(summar\w*|overview|recap|digest|roundup)\b|tl;?dr").unwrap());
static DECISION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(decide[ds]?|decision[s]?|chose|choose|chosen|picked|opted|settled on|went with)\b")
        .unwrap()
});
static ACTION_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(todo[s]?|to-do[s]?|action item[s]?|task[s]?|follow[- ]?up[s]?|next step[s]?|need to do)\b")
        .unwrap()
});
static LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(list|enumerate|show (?:me )?(?:all|every)|all (?:the|my)|every)\b").unwrap()
});
static INTERROGATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(who|what|when|where|why|how|which|whose|did|do|does|is|are|was|were|can|could|should|would|will|have|has)\b")
        .unwrap()
});

enum TimeRule {
    Fixed(u32),
    /// Capture group 1 is a count, scaled by a day multiplier and bounded.
    Relative { per_unit: u32, max_units: u32 },
}

static TIME_PATTERNS: Lazy<Vec<(Regex, TimeRule)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\btoday\b").unwrap(), TimeRule::Fixed(1)),
        (Regex::new(r"(?i)\byesterday\b").unwrap(), TimeRule::Fixed(2)),
        (
            Regex::new(r"(?i)\b(?:this|past|last) week\b").unwrap(),
            TimeRule::Fixed(7),
        ),
        (
            Regex::new(r"(?i)\b(?:this|past|last) month\b").unwrap(),
            TimeRule::Fixed(30),
        ),
        (
            Regex::new(r"(?i)\b(?:this|past|last) quarter\b").unwrap(),
            TimeRule::Fixed(90),
        ),
        (
            Regex::new(r"(?i)\b(?:this|past|last) year\b").unwrap(),
            TimeRule::Fixed(365),
        ),
        (
            Regex::new(r"(?i)\b(?:last|past|previous) (\d{1,3}) days?\b").unwrap(),
            TimeRule::Relative {
                per_unit: 1,
                max_units: 365,
            },
        ),
        (
            Regex::new(r"(?i)\b(?:last|past|previous) (\d{1,2}) weeks?\b").unwrap(),
            TimeRule::Relative {
                per_unit: 7,
                max_units: 52,
            },
        ),
        (
            Regex::new(r"(?i)\b(?:last|past|previous) (\d{1,2}) months?\b").unwrap(),
            TimeRule::Relative {
                per_unit: 30,
                max_units: 12,
            },
        ),
    ]
});

static QUOTED_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]{2,60})""#).unwrap());
static CAPITALIZED_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)+)\b").unwrap());
static INTERROGATIVE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(who|what|when|where|why|how|which|did|does|is|are|the)\b").unwrap()
});

// A token reads as a unique identifier when it mixes letters with digits or
// underscores (`deploy_v2`, `CITE_TEST_002`, `proj7`).
static UID_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_]*[0-9_][a-z0-9_]*$").unwrap());
static UID_SNAKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z]+_[a-z0-9_]+$").unwrap());
static HAS_DIGIT_OR_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9_]").unwrap());

pub fn is_unique_identifier(token: &str) -> bool {
    if token.len() < 3 || !HAS_DIGIT_OR_UNDERSCORE.is_match(token) {
        return false;
    }
    UID_ALNUM.is_match(token) || UID_SNAKE.is_match(token)
}

/// Trim, collapse whitespace, strip exotic punctuation, cap length.
/// Idempotent.
pub fn normalize_query(query: &str) -> String {
    let filtered: String = query
        .chars()
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '.' | ',' | '!' | '?' | '\'' | '"' | '-' | '_' | '$' | ':' | '/' | '(' | ')' | '%' | '&' | '+' | '#' | '@')
        })
        .collect();
    let collapsed = filtered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(QUERY_MAX_CHARS).collect()
}

fn classify_intent(normalized: &str) -> Intent {
    if SUMMARIZE.is_match(normalized) {
        Intent::Summarize
    } else if DECISION.is_match(normalized) {
        Intent::Decision
    } else if ACTION_ITEM.is_match(normalized) {
        Intent::ActionItem
    } else if LIST.is_match(normalized) {
        Intent::List
    } else if INTERROGATIVE.is_match(normalized) {
        Intent::Question
    } else {
        Intent::Search
    }
}

fn infer_time_hint(normalized: &str) -> Option<u32> {
    for (regex, rule) in TIME_PATTERNS.iter() {
        let Some(caps) = regex.captures(normalized) else {
            continue;
        };
        return Some(match rule {
            TimeRule::Fixed(days) => *days,
            TimeRule::Relative { per_unit, max_units } => {
                let n: u32 = caps.get(1)?.as_str().parse().ok()?;
                if n == 0 || n > *max_units {
                    continue;
                }
                n * per_unit
            }
        });
    }
    None
}

fn detect_entities(query: &str) -> Vec<String> {
    let mut entities = Vec::new();
    for caps in QUOTED_SPAN.captures_iter(query) {
        let span = caps[1].trim().to_string();
        if !span.is_empty() && !entities.contains(&span) {
            entities.push(span);
        }
    }
    for caps in CAPITALIZED_RUN.captures_iter(query) {
        let run = caps[1].to_string();
        if INTERROGATIVE_WORD.is_match(&run) {
            continue;
        }
        if !entities.contains(&run) {
            entities.push(run);
        }
    }
    entities.truncate(ENTITY_MAX);
    entities
}

fn intent_synonyms(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Decision => &["decided", "chose", "decision", "rationale", "option"],
        Intent::ActionItem => &["todo", "task", "action", "followup", "deadline"],
        Intent::Summarize => &["summary", "notes", "highlights"],
        Intent::List => &["items", "entries"],
        Intent::Question | Intent::Search => &[],
    }
}

fn boost_terms(keywords: &[String], intent: Intent) -> Vec<String> {
    let mut out: Vec<String> = keywords.to_vec();
    for syn in intent_synonyms(intent) {
        let syn = syn.to_string();
        if !out.contains(&syn) {
            out.push(syn);
        }
    }
    out.truncate(BOOST_TERMS_MAX);
    out
}

/// Analyze a raw query. Pure and deterministic; call once per request and
/// pass the result around.
pub fn analyze(query: &str) -> QueryAnalysis {
    let normalized = normalize_query(query);
    let intent = classify_intent(&normalized);
    let keywords = extract_terms(&normalized);
    let time_hint_days = infer_time_hint(&normalized);
    // Entity casing matters, so detection runs on the raw input.
    let entities = detect_entities(query);
    let boost_terms = boost_terms(&keywords, intent);

    QueryAnalysis {
        normalized,
        keywords,
        intent,
        time_hint_days,
        entities,
        boost_terms,
    }
}
