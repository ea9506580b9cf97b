//! Embedding model client for OpenAI-compatible `/embeddings` endpoints.

use async_trait::async_trait;
use serde_json::json;

use crate::core::error::{Error, Result};
use crate::embedding::EmbeddingModel;

pub struct OpenAiCompatEmbedding {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatEmbedding {
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

    /// Build from `EMBEDDING_API_BASE_URL` (or `OPENAI_BASE_URL`) + optional
    /// `OPENAI_API_KEY`. None when unconfigured.
    pub fn from_env(client: reqwest::Client, model: &str) -> Option<Self> {
        let base = std::env::var("EMBEDDING_API_BASE_URL")
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
}

fn extract_vectors(value: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = value
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Upstream("embeddings response missing data".into()))?;
    if data.len() != expected {
        return Err(Error::Upstream(format!(
            "embeddings response had {} rows for {} inputs",
            data.len(),
            expected
        )));
    }
    data.iter()
        .map(|row| {
            row.get("embedding")
                .and_then(|e| e.as_array())
                .map(|nums| {
                    nums.iter()
                        .filter_map(|n| n.as_f64())
                        .map(|f| f as f32)
                        .collect::<Vec<f32>>()
                })
                .ok_or_else(|| Error::Upstream("embeddings row missing vector".into()))
        })
        .collect()
}

#[async_trait]
impl EmbeddingModel for OpenAiCompatEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("embedding endpoint: {}", e)))?;

        let status = resp.status();
        match status.as_u16() {
            200..=299 => {}
            429 => return Err(Error::RateLimited("embedding quota exhausted".into())),
            400 | 422 => {
                return Err(Error::Validation(format!(
                    "embedding request rejected: {}",
                    status
                )))
            }
            401 | 403 => return Err(Error::Config(format!("embedding auth failed: {}", status))),
            _ => return Err(Error::Upstream(format!("embedding endpoint returned {}", status))),
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("embedding decode: {}", e)))?;
        extract_vectors(&value, texts.len())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
