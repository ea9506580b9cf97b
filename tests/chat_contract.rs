//! Citation-contract tests: every token in an answer must resolve to a pack
//! entry, citations come back in first-use order, and the streamed wire form
//! drops the `N` prefix while validation runs on the raw buffer.

mod common;

use common::{rig, seed_note, ScriptedGenerator};
use notescout::answer::source_pack::build_source_pack;
use notescout::answer::validator::extract_citation_ids;
use notescout::answer::GroundedGenerator;
use notescout::transport::{Confidence, StreamEvent};
use notescout::{RetrievalOptions, Result};
use std::sync::Arc;

#[tokio::test]
async fn short_note_answer_carries_exactly_one_citation() -> Result<()> {
    let r = rig(false);
    seed_note(&r, "n", "t1", "Budget is $50,000.", 0).await;

    let (retrieval, analysis) = r
        .engine
        .retrieve("budget", &RetrievalOptions::new("t1"))
        .await?;
    let pack = build_source_pack(&retrieval.chunks, 250);
    assert_eq!(pack.source_count(), 1);

    let model = ScriptedGenerator::new(&["The budget is $50,000 [N1]."]);
    let generator = GroundedGenerator::new(model, r.config.clone());
    let resp = generator
        .answer("budget", analysis.intent, &pack, &retrieval)
        .await?;

    assert!(resp.answer.contains("[N1]"));
    assert_eq!(resp.citations.len(), 1);
    assert_eq!(resp.citations[0].cid, "N1");
    assert_eq!(resp.citations[0].note_id, "n");
    assert_eq!(resp.citations[0].chunk_id, "n_000");
    assert!((0.0..=1.0).contains(&resp.citations[0].score));
    Ok(())
}

#[tokio::test]
async fn decision_answer_cites_the_postgresql_note() -> Result<()> {
    let r = rig(false);
    seed_note(&r, "a", "t1", "PROJECT_ALPHA revenue grew 25%", 3).await;
    seed_note(&r, "b", "t1", "We chose PostgreSQL over MongoDB", 2).await;
    seed_note(&r, "c", "t1", "Kickoff budget $200000", 1).await;

    let query = "what did we decide about the database";
    let (retrieval, analysis) = r.engine.retrieve(query, &RetrievalOptions::new("t1")).await?;
    assert_eq!(retrieval.chunks[0].chunk.note_id, "b");

    let pack = build_source_pack(&retrieval.chunks, 250);
    let model = ScriptedGenerator::new(&["We decided to use PostgreSQL over MongoDB [N1]."]);
    let generator = GroundedGenerator::new(model, r.config.clone());
    let resp = generator.answer(query, analysis.intent, &pack, &retrieval).await?;

    assert!(resp.answer.to_lowercase().contains("postgresql"));
    let ids = extract_citation_ids(&resp.answer);
    assert!(!ids.is_empty());
    // The first citation resolves to the PostgreSQL note.
    assert_eq!(resp.citations[0].note_id, "b");
    Ok(())
}

#[tokio::test]
async fn every_answer_token_resolves_to_a_returned_citation() -> Result<()> {
    let r = rig(false);
    seed_note(&r, "a", "t1", "Fact about the rollout schedule", 1).await;
    seed_note(&r, "b", "t1", "Fact about the launch checklist", 2).await;

    let query = "rollout schedule and launch checklist";
    let (retrieval, analysis) = r.engine.retrieve(query, &RetrievalOptions::new("t1")).await?;
    let pack = build_source_pack(&retrieval.chunks, 250);

    // The script references a phantom token; the generator must strip it.
    let model = ScriptedGenerator::new(&["Schedule [N1], checklist [N2], phantom [N9]."]);
    let generator = GroundedGenerator::new(model, r.config.clone());
    let resp = generator.answer(query, analysis.intent, &pack, &retrieval).await?;

    let cids: Vec<String> = resp.citations.iter().map(|c| c.cid.clone()).collect();
    for id in extract_citation_ids(&resp.answer) {
        assert!(
            cids.contains(&format!("N{}", id)),
            "token N{} missing from citations",
            id
        );
    }
    // cids unique and in first-use order.
    let mut deduped = cids.clone();
    deduped.dedup();
    assert_eq!(cids, deduped);
    assert!(resp.citations.len() <= pack.source_count());
    assert!(!resp.answer.contains("[N9]"));
    Ok(())
}

#[tokio::test]
async fn stream_wire_form_uses_bare_indices_and_valid_sources() -> Result<()> {
    let r = rig(false);
    seed_note(&r, "n", "t1", "Budget is $50,000.", 0).await;

    let (retrieval, analysis) = r
        .engine
        .retrieve("budget", &RetrievalOptions::new("t1"))
        .await?;
    let pack = Arc::new(build_source_pack(&retrieval.chunks, 250));

    let model = ScriptedGenerator::new(&["The budget is $50,000 [N1]."]);
    let generator = Arc::new(GroundedGenerator::new(model, r.config.clone()));

    let mut rx = generator.answer_stream(
        "budget".to_string(),
        analysis.intent,
        pack.clone(),
        vec![],
        retrieval.strategy.clone(),
    );

    let mut source_ids: Vec<String> = Vec::new();
    let mut token_text = String::new();
    let mut saw_done = false;
    let mut order: Vec<&'static str> = Vec::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Sources { sources } => {
                order.push("sources");
                source_ids = sources.iter().map(|s| s.id.clone()).collect();
            }
            StreamEvent::Token { content } => {
                order.push("token");
                token_text.push_str(&content);
            }
            StreamEvent::Done { meta } => {
                order.push("done");
                saw_done = true;
                assert_eq!(meta.source_count, 1);
                assert_eq!(meta.confidence, Confidence::Medium);
            }
            StreamEvent::Followups { suggestions } => {
                order.push("followups");
                assert!(!suggestions.is_empty() && suggestions.len() <= 3);
            }
            StreamEvent::Error { error } => panic!("unexpected error event: {}", error),
            _ => {}
        }
    }

    assert!(saw_done);
    assert_eq!(order.first(), Some(&"sources"));
    assert_eq!(order.last(), Some(&"done"));
    assert_eq!(source_ids, vec!["N1"]);

    // Client form drops the N prefix; the raw form never reaches the wire.
    assert!(token_text.contains("[1]"));
    assert!(!token_text.contains("[N1]"));
    Ok(())
}

#[tokio::test]
async fn empty_corpus_streams_an_honest_no_match() -> Result<()> {
    let r = rig(false);
    let (retrieval, analysis) = r
        .engine
        .retrieve("anything at all", &RetrievalOptions::new("t1"))
        .await?;
    assert!(retrieval.chunks.is_empty());

    let pack = Arc::new(build_source_pack(&retrieval.chunks, 250));
    let model = ScriptedGenerator::new(&[]);
    let generator = Arc::new(GroundedGenerator::new(model, r.config.clone()));

    let mut rx = generator.answer_stream(
        "anything at all".to_string(),
        analysis.intent,
        pack,
        vec![],
        retrieval.strategy.clone(),
    );

    let mut confidence = None;
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Token { content } => text.push_str(&content),
            StreamEvent::Done { meta } => confidence = Some(meta.confidence),
            _ => {}
        }
    }
    assert_eq!(confidence, Some(Confidence::None));
    assert!(text.to_lowercase().contains("couldn't find"));
    Ok(())
}
