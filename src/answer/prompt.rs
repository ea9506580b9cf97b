//! Intent-adaptive prompt assembly from the source pack. The user block is
//! built by walking the pack in token order, which guarantees the prompt's
//! source count equals the pack size.

use crate::answer::source_pack::SourcePack;
use crate::core::types::Intent;

fn format_guidance(intent: Intent) -> &'static str {
    match intent {
        Intent::Question | Intent::Search => {
            "Lead with a direct answer to the question, then add supporting detail."
        }
        Intent::Summarize => {
            "Write a short narrative summary that ties the sources together chronologically where it helps."
        }
        Intent::List => "Answer as a bulleted list, one item per line.",
        Intent::Decision => {
            "Write a decision brief: what was decided, when, and the recorded rationale."
        }
        Intent::ActionItem => {
            "Write an action plan: outstanding items first, each with any noted owner or deadline."
        }
    }
}

/// System and user prompt pair for one grounded generation.
pub fn build_prompts(pack: &SourcePack, query: &str, intent: Intent) -> (String, String) {
    let count = pack.source_count();

    let system = format!(
        "You are an assistant that answers questions using only the user's own notes.\n\
         \n\
         Citation rules:\n\
         - Every factual claim must carry an inline citation token like [N1].\n\
         - The only legal tokens are N1 through N{count}; never invent others.\n\
         - Cite the single most relevant source per claim; multiple tokens are allowed when a claim draws on several sources.\n\
         \n\
         {guidance}\n\
         \n\
         If the sources only partially cover the question, share what is relevant and say what is missing. \
         If nothing matches, say so honestly instead of guessing. \
         Keep the tone plain and direct.",
        count = count,
        guidance = format_guidance(intent),
    );

    let sources = pack
        .entries()
        .iter()
        .map(|e| {
            format!(
                "[{}] ({}): {}",
                e.token,
                e.created_at.format("%Y-%m-%d"),
                e.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    let user = format!("{}\n\nQuestion: {}", sources, query);
    (system, user)
}
