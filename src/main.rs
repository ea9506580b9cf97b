use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use std::convert::Infallible;
use std::env;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use notescout::answer::llm::OpenAiCompatModel;
use notescout::answer::source_pack::build_source_pack;
use notescout::embedding::rest::OpenAiCompatEmbedding;
use notescout::retrieval::cross_http::HttpCrossEncoder;
use notescout::store::MemoryStore;
use notescout::{
    AppState, ChatRequest, ChatResponse, Config, Error, ErrorResponse, IndexNoteRequest,
    IndexNoteResponse, Note, RetrievalOptions,
};

/// Default number of sources fed to the generator when the request does not
/// set `limit`.
const DEFAULT_SOURCE_LIMIT: usize = 8;
const MAX_SOURCE_LIMIT: usize = 25;
const MESSAGE_MAX_CHARS: usize = 2_000;

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["NOTESCOUT_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting notescout");
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;

    // Create HTTP client
    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let connect_timeout = env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(http_timeout))
        .connect_timeout(std::time::Duration::from_secs(connect_timeout))
        .build()?;

    // Standalone mode keeps chunks in memory; the production document store
    // is an external collaborator behind the same trait.
    let store = MemoryStore::shared();
    info!("document store: in-memory (standalone mode)");

    let embedding_model = OpenAiCompatEmbedding::from_env(http_client.clone(), &config.embedding.model)
        .map(|m| Arc::new(m) as Arc<dyn notescout::embedding::EmbeddingModel>);
    let generative_model = OpenAiCompatModel::from_env(http_client.clone(), &config.llm.model)
        .map(|m| Arc::new(m) as Arc<dyn notescout::answer::GenerativeModel>);
    let cross_encoder = config.cross_encoder_url.clone().map(|url| {
        Arc::new(HttpCrossEncoder::new(http_client.clone(), url))
            as Arc<dyn notescout::retrieval::CrossEncoder>
    });

    let state = Arc::new(AppState::build(
        config,
        http_client,
        store,
        embedding_model,
        generative_model,
        cross_encoder,
    ));

    // Build router
    let app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/chat", post(chat_handler))
        .route("/api/notes/index", post(index_note_handler))
        .route("/api/notes/{id}", delete(remove_note_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start server
    let port: u16 = parse_port_from_args().or_else(port_from_env).unwrap_or(5100);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/NOTESCOUT_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("notescout listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    state.shutdown();
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "notescout",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn error_response(e: Error) -> Response {
    match &e {
        Error::Validation(_) | Error::NotFound(_) => {
            info!("request rejected: {}", e);
        }
        Error::Internal(_) => error!("internal failure: {}", e),
        other => warn!("request failed: {}", other),
    }
    (
        e.status_code(),
        Json(ErrorResponse {
            error: e.public_message(),
        }),
    )
        .into_response()
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    match chat_inner(state, headers, request).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn chat_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    request: ChatRequest,
) -> notescout::Result<Response> {
    let message = request.message.trim().to_string();
    if message.is_empty() {
        return Err(Error::Validation("message must not be empty".into()));
    }
    if message.len() > MESSAGE_MAX_CHARS {
        return Err(Error::Validation(format!(
            "message exceeds {} characters",
            MESSAGE_MAX_CHARS
        )));
    }

    let generator = state
        .generator
        .clone()
        .ok_or_else(|| Error::Config("chat model not configured".into()))?;

    let tenant_id = request
        .tenant_id
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.default_tenant.clone());
    let source_limit = request
        .limit
        .unwrap_or(DEFAULT_SOURCE_LIMIT)
        .clamp(1, MAX_SOURCE_LIMIT);

    let opts = RetrievalOptions {
        rerank_to: (source_limit * 2).min(MAX_SOURCE_LIMIT),
        ..RetrievalOptions::new(tenant_id)
    };
    let (retrieval, analysis) = state.retrieval.retrieve(&message, &opts).await?;

    let pack_len = source_limit.min(retrieval.chunks.len());
    let pack = build_source_pack(
        &retrieval.chunks[..pack_len],
        state.config.citation.snippet_max_chars,
    );
    let context_chunks: Vec<_> = retrieval.chunks[pack_len..].to_vec();

    if wants_event_stream(&headers) {
        let rx = generator.answer_stream(
            message,
            analysis.intent,
            Arc::new(pack),
            context_chunks,
            retrieval.strategy.clone(),
        );
        // StreamEvent::to_frame is the only encoder of the wire format.
        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|event| (Ok::<String, Infallible>(event.to_frame()), rx))
        });
        let response = Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(frames))
            .map_err(|e| Error::Internal(format!("stream response build: {}", e)))?;
        return Ok(response);
    }

    let response: ChatResponse = generator
        .answer(&message, analysis.intent, &pack, &retrieval)
        .await?;
    Ok(Json(response).into_response())
}

async fn index_note_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IndexNoteRequest>,
) -> Response {
    if request.id.trim().is_empty() || request.tenant_id.trim().is_empty() {
        return error_response(Error::Validation("id and tenantId are required".into()));
    }

    let now = Utc::now();
    let note = Note {
        id: request.id.clone(),
        tenant_id: request.tenant_id.clone(),
        text: request.text.clone(),
        created_at: request.created_at.unwrap_or(now),
        updated_at: now,
    };

    match state.indexer.process_note(&note).await {
        Ok(outcome) => Json(IndexNoteResponse {
            note_id: note.id,
            chunks_written: outcome.chunks_written,
            unchanged: outcome.unchanged,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_note_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.indexer.remove_note(&id).await {
        Ok(0) => error_response(Error::NotFound(format!("note {} has no indexed chunks", id))),
        Ok(removed) => (
            StatusCode::OK,
            Json(serde_json::json!({ "noteId": id, "chunksRemoved": removed })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
