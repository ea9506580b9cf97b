//! Grounded answer generation: call the generative model with the assembled
//! prompt, validate citations against the source pack, optionally repair,
//! and (for streaming) push the SSE envelope sequence.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::answer::prompt::build_prompts;
use crate::answer::source_pack::SourcePack;
use crate::answer::validator::{
    citations_in_order, strip_invalid_tokens, validate_citations,
};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{ChatMeta, ChatResponse, Intent, RetrievalMeta, RetrievalResult, ScoredChunk};
use crate::transport::{
    sources_event, CitationNormalizer, Confidence, ContextSource, DoneMeta, StreamEvent,
    CONTEXT_SOURCES_MAX, HEARTBEAT_INTERVAL_SECS,
};

/// Initial attempt plus up to two retries.
const MAX_ATTEMPTS: u32 = 3;
/// Repair fires when fewer than half the pack's sources are cited.
const REPAIR_COVERAGE_FLOOR: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// External generative model seam: non-streaming and streaming completion.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn complete(&self, req: &GenerationRequest) -> Result<String>;

    /// Token stream for one completion. Items are raw text deltas.
    async fn stream_complete(
        &self,
        req: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>>;

    fn model_id(&self) -> &str;
}

pub struct GroundedGenerator {
    model: Arc<dyn GenerativeModel>,
    config: Arc<Config>,
}

impl GroundedGenerator {
    pub fn new(model: Arc<dyn GenerativeModel>, config: Arc<Config>) -> Self {
        Self { model, config }
    }

    pub fn model_id(&self) -> String {
        self.model.model_id().to_string()
    }

    fn request(&self, pack: &SourcePack, query: &str, intent: Intent) -> GenerationRequest {
        let (system, user) = build_prompts(pack, query, intent);
        GenerationRequest {
            system,
            user,
            temperature: self.config.llm.chat_temperature,
            max_tokens: None,
        }
    }

    /// Non-streaming grounded answer.
    pub async fn answer(
        &self,
        query: &str,
        intent: Intent,
        pack: &SourcePack,
        retrieval: &RetrievalResult,
    ) -> Result<ChatResponse> {
        if pack.is_empty() {
            // Honest no-match reply; nothing legal to cite.
            return Ok(ChatResponse {
                answer: "I couldn't find anything in your notes about that.".to_string(),
                citations: Vec::new(),
                meta: self.meta(pack, retrieval),
            });
        }

        let req = self.request(pack, query, intent);
        let mut answer = self.complete_with_retry(&req).await?;

        let mut validation = validate_citations(&answer, pack);
        if !validation.invalid.is_empty() {
            warn!(
                invalid = ?validation.invalid,
                source_count = pack.source_count(),
                "generator emitted out-of-pack citation tokens"
            );
        }

        if validation.coverage < REPAIR_COVERAGE_FLOOR && self.config.citation.repair_enabled {
            if let Some(repaired) = self.try_repair(&req, &answer, pack).await {
                let repaired_validation = validate_citations(&repaired, pack);
                if repaired_validation.coverage > validation.coverage {
                    debug!(
                        before = validation.coverage,
                        after = repaired_validation.coverage,
                        "citation repair accepted"
                    );
                    answer = repaired;
                    validation = repaired_validation;
                }
            }
        }
        if validation.coverage < REPAIR_COVERAGE_FLOOR {
            info!(
                citation_coverage = validation.coverage,
                "answer cites under half of the source pack"
            );
        }

        // Offending tokens are removed rather than failing the request.
        let answer = strip_invalid_tokens(&answer, pack);
        let citations = citations_in_order(&answer, pack);

        if self.config.citation.claim_anchoring_enabled {
            let flags = crate::answer::validator::anchor_claims(
                &answer,
                pack,
                self.config.citation.semantic_match_threshold,
                self.config.citation.min_overlap_score,
            );
            for flag in &flags {
                warn!(
                    token = %flag.token,
                    overlap = flag.overlap,
                    kind = ?flag.kind,
                    suggested = ?flag.suggested_token,
                    "cited excerpt may not support the claim"
                );
            }
        }

        Ok(ChatResponse {
            answer,
            citations,
            meta: self.meta(pack, retrieval),
        })
    }

    /// Streaming grounded answer. Spawns the generation and heartbeat tasks
    /// and returns the event receiver; the channel closes after `done` or
    /// `error`.
    pub fn answer_stream(
        self: Arc<Self>,
        query: String,
        intent: Intent,
        pack: Arc<SourcePack>,
        context_chunks: Vec<ScoredChunk>,
        retrieval_strategy: String,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        tokio::spawn(async move {
            let _ = tx.send(sources_event(&pack)).await;

            let context_sources: Vec<ContextSource> = context_chunks
                .iter()
                .take(CONTEXT_SOURCES_MAX)
                .map(|c| ContextSource {
                    note_id: c.chunk.note_id.clone(),
                    preview: c.chunk.anchor.clone(),
                    relevance: (c.combined_score as f64 * 100.0).round() / 100.0,
                })
                .collect();
            let context_count = context_sources.len();
            if !context_sources.is_empty() {
                let _ = tx
                    .send(StreamEvent::ContextSources {
                        sources: context_sources,
                    })
                    .await;
            }

            // Heartbeats run until generation settles, then get aborted.
            let heartbeat = {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut seq: u64 = 0;
                    let mut tick =
                        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
                    tick.tick().await; // swallow the immediate first tick
                    loop {
                        tick.tick().await;
                        seq += 1;
                        if tx.send(StreamEvent::Heartbeat { seq }).await.is_err() {
                            break;
                        }
                    }
                })
            };

            let outcome = self
                .stream_answer_inner(&tx, &query, intent, &pack)
                .await;
            heartbeat.abort();

            match outcome {
                Ok(raw_answer) => {
                    let validation = validate_citations(&raw_answer, &pack);
                    if !validation.invalid.is_empty() {
                        warn!(
                            invalid = ?validation.invalid,
                            "streamed answer used out-of-pack citation tokens"
                        );
                    }
                    let _ = tx
                        .send(StreamEvent::Followups {
                            suggestions: followups(intent, validation.cited.len()),
                        })
                        .await;
                    let _ = tx
                        .send(StreamEvent::Done {
                            meta: DoneMeta {
                                model: self.model.model_id().to_string(),
                                request_id: Some(request_id),
                                response_time_ms: started.elapsed().as_millis() as u64,
                                confidence: Confidence::from_counts(
                                    pack.source_count(),
                                    validation.cited.len(),
                                ),
                                source_count: pack.source_count(),
                                context_source_count: Some(context_count),
                            },
                        })
                        .await;
                    debug!(strategy = %retrieval_strategy, "stream complete");
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: e.public_message(),
                        })
                        .await;
                }
            }
            // tx drops here, ending the response stream in all paths.
        });

        rx
    }

    /// Drive the model stream: emit normalized token events, return the raw
    /// accumulated answer for validation.
    async fn stream_answer_inner(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        query: &str,
        intent: Intent,
        pack: &SourcePack,
    ) -> Result<String> {
        if pack.is_empty() {
            let msg = "I couldn't find anything in your notes about that.";
            let _ = tx
                .send(StreamEvent::Token {
                    content: msg.to_string(),
                })
                .await;
            return Ok(msg.to_string());
        }

        let req = self.request(pack, query, intent);
        let deadline = Duration::from_millis(self.config.llm.chat_timeout_ms);
        let mut stream = tokio::time::timeout(deadline, self.model.stream_complete(&req))
            .await
            .map_err(|_| Error::Upstream("generator stream open timed out".into()))??;

        let mut raw = String::new();
        let mut normalizer = CitationNormalizer::new();
        loop {
            let next = tokio::time::timeout(deadline, stream.next()).await;
            match next {
                Ok(Some(Ok(delta))) => {
                    raw.push_str(&delta);
                    let display = normalizer.feed(&delta);
                    if !display.is_empty() {
                        let _ = tx.send(StreamEvent::Token { content: display }).await;
                    }
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => break,
                Err(_) => return Err(Error::Upstream("generator stream stalled".into())),
            }
        }
        let tail = normalizer.finish();
        if !tail.is_empty() {
            let _ = tx.send(StreamEvent::Token { content: tail }).await;
        }
        Ok(raw)
    }

    /// One repair round: ask the model to weave in missing citations.
    async fn try_repair(
        &self,
        original: &GenerationRequest,
        answer: &str,
        pack: &SourcePack,
    ) -> Option<String> {
        let req = GenerationRequest {
            system: original.system.clone(),
            user: format!(
                "{}\n\nYour previous draft is below. Rewrite it so every factual claim carries \
                 an inline citation token from N1..N{}; keep the content otherwise unchanged.\n\n{}",
                original.user,
                pack.source_count(),
                answer
            ),
            temperature: self.config.llm.chat_temperature,
            max_tokens: None,
        };
        match self.complete_with_retry(&req).await {
            Ok(repaired) => Some(repaired),
            Err(e) => {
                warn!("citation repair call failed: {}", e);
                None
            }
        }
    }

    /// Deadline-raced completion with exponential backoff. Quota exhaustion
    /// and argument/permission failures never retry.
    async fn complete_with_retry(&self, req: &GenerationRequest) -> Result<String> {
        let deadline = Duration::from_millis(self.config.llm.chat_timeout_ms);
        let attempts = AtomicU32::new(0);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(8))
            .with_max_elapsed_time(None)
            .build();

        retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match tokio::time::timeout(deadline, self.model.complete(req)).await {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e @ (Error::RateLimited(_) | Error::Validation(_) | Error::Config(_)))) => {
                    Err(backoff::Error::permanent(e))
                }
                Ok(Err(e)) if attempt >= MAX_ATTEMPTS => Err(backoff::Error::permanent(e)),
                Ok(Err(e)) => {
                    debug!(attempt, "generator attempt failed: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(_) if attempt >= MAX_ATTEMPTS => Err(backoff::Error::permanent(
                    Error::Upstream("generator deadline exceeded".into()),
                )),
                Err(_) => Err(backoff::Error::transient(Error::Upstream(
                    "generator deadline exceeded".into(),
                ))),
            }
        })
        .await
    }

    fn meta(&self, pack: &SourcePack, retrieval: &RetrievalResult) -> ChatMeta {
        ChatMeta {
            model: self.model.model_id().to_string(),
            retrieval: RetrievalMeta {
                k: pack.source_count(),
                strategy: retrieval.strategy.clone(),
                candidate_count: Some(retrieval.counts.merged),
                rerank_count: Some(retrieval.chunks.len()),
                time_ms: Some(retrieval.timings.total_ms),
            },
        }
    }
}

/// Content-adaptive follow-up suggestions for the `followups` event.
pub fn followups(intent: Intent, cited_count: usize) -> Vec<String> {
    let mut out: Vec<String> = match intent {
        Intent::Decision => vec![
            "What alternatives did I consider?".to_string(),
            "When did I make this decision?".to_string(),
        ],
        Intent::ActionItem => vec![
            "Which of these are overdue?".to_string(),
            "What did I finish recently?".to_string(),
        ],
        Intent::Summarize => vec![
            "What changed since last week?".to_string(),
            "What were the key decisions?".to_string(),
        ],
        Intent::List => vec![
            "Which of these matter most right now?".to_string(),
            "What's missing from this list?".to_string(),
        ],
        Intent::Question | Intent::Search => vec![
            "Is there more context around this?".to_string(),
            "What else did I write about this topic?".to_string(),
        ],
    };
    if cited_count > 1 {
        out.push("Show me the full notes behind these sources.".to_string());
    }
    out.truncate(3);
    out
}
