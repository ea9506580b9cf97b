//! Context assembly: pack the scored list into a character budget with a
//! per-note cap, then backfill spare budget from the skipped list.

use crate::core::types::{Intent, ScoredChunk};
use std::collections::HashMap;

/// Chunks per note admitted in the first pass.
const NOTE_CAP_AGGREGATION: usize = 3;
const NOTE_CAP_POINTED: usize = 6;
/// Backfill only runs when the first pass left this much budget unused.
const BACKFILL_UTILIZATION: f64 = 0.90;

pub fn note_cap(intent: Intent) -> usize {
    if intent.is_aggregation() {
        NOTE_CAP_AGGREGATION
    } else {
        NOTE_CAP_POINTED
    }
}

/// Budget-and-cap packing. Returns the final list sorted by score.
pub fn assemble_context(
    scored: Vec<ScoredChunk>,
    budget: usize,
    intent: Intent,
) -> Vec<ScoredChunk> {
    let cap = note_cap(intent);
    let mut included: Vec<ScoredChunk> = Vec::new();
    let mut skipped: Vec<ScoredChunk> = Vec::new();
    let mut per_note: HashMap<String, usize> = HashMap::new();
    let mut total_chars = 0usize;

    for cand in scored {
        let note_count = per_note.get(&cand.chunk.note_id).copied().unwrap_or(0);
        if total_chars + cand.chunk.text.len() <= budget && note_count < cap {
            total_chars += cand.chunk.text.len();
            *per_note.entry(cand.chunk.note_id.clone()).or_insert(0) += 1;
            included.push(cand);
        } else {
            skipped.push(cand);
        }
    }

    // Spare budget goes to the best skipped chunks, cap no longer applies.
    if (total_chars as f64) < BACKFILL_UTILIZATION * budget as f64 {
        for cand in skipped {
            if total_chars + cand.chunk.text.len() <= budget {
                total_chars += cand.chunk.text.len();
                included.push(cand);
            }
        }
    }

    crate::retrieval::rerank::sort_by_score(&mut included);
    included
}
