//! Generative model client for OpenAI-compatible chat endpoints (hosted or
//! local; point the base URL at any server speaking the same dialect).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::answer::generator::{GenerationRequest, GenerativeModel};
use crate::core::error::{Error, Result};

pub struct OpenAiCompatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatModel {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    /// Build from the environment when a chat endpoint is configured:
    /// `CHAT_API_BASE_URL` (or `OPENAI_BASE_URL`) + optional
    /// `OPENAI_API_KEY`. Returns None when unconfigured.
    pub fn from_env(client: reqwest::Client, model: &str) -> Option<Self> {
        let base = std::env::var("CHAT_API_BASE_URL")
            .or_else(|_| std::env::var("OPENAI_BASE_URL"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Some(Self::new(client, base, api_key, model))
    }

    fn body(&self, req: &GenerationRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user},
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("chat endpoint: {}", e)))?;
        map_status(resp)
    }
}

fn map_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    match status.as_u16() {
        200..=299 => Ok(resp),
        429 => Err(Error::RateLimited("chat quota exhausted".into())),
        400 | 422 => Err(Error::Validation(format!("chat request rejected: {}", status))),
        401 | 403 => Err(Error::Config(format!("chat auth failed: {}", status))),
        _ => Err(Error::Upstream(format!("chat endpoint returned {}", status))),
    }
}

/// Text content of a non-streaming completion response.
fn extract_content(value: &serde_json::Value) -> Option<String> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Delta text of one streamed SSE data line, or None for keep-alives and the
/// terminal `[DONE]` marker.
fn extract_delta(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl GenerativeModel for OpenAiCompatModel {
    async fn complete(&self, req: &GenerationRequest) -> Result<String> {
        let resp = self.post(self.body(req, false)).await?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("chat decode: {}", e)))?;
        extract_content(&value)
            .ok_or_else(|| Error::Upstream("chat response missing content".into()))
    }

    async fn stream_complete(
        &self,
        req: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let resp = self.post(self.body(req, true)).await?;
        let (tx, rx) = mpsc::channel::<Result<String>>(32);

        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(piece) = bytes.next().await {
                match piece {
                    Ok(b) => {
                        buffer.push_str(&String::from_utf8_lossy(&b));
                        while let Some(nl) = buffer.find('\n') {
                            let line = buffer[..nl].trim_end_matches('\r').to_string();
                            buffer.drain(..=nl);
                            if let Some(delta) = extract_delta(&line) {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Upstream(format!("chat stream: {}", e))))
                            .await;
                        return;
                    }
                }
            }
            if let Some(delta) = extract_delta(buffer.trim_end()) {
                let _ = tx.send(Ok(delta)).await;
            }
            debug!("chat stream closed");
        });

        let stream =
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
        Ok(stream.boxed())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
