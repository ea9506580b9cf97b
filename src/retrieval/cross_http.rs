//! HTTP client for a cross-encoder scoring sidecar: one relevance float per
//! candidate text.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::core::error::{Error, Result};
use crate::retrieval::rerank::CrossEncoder;

pub struct HttpCrossEncoder {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

impl HttpCrossEncoder {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "texts": texts }))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("cross-encoder: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "cross-encoder returned {}",
                resp.status()
            )));
        }
        let body: ScoreResponse = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("cross-encoder decode: {}", e)))?;
        if body.scores.len() != texts.len() {
            return Err(Error::Upstream(format!(
                "cross-encoder scored {} of {} texts",
                body.scores.len(),
                texts.len()
            )));
        }
        Ok(body.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_response_shape() {
        let parsed: ScoreResponse =
            serde_json::from_str(r#"{"scores": [0.9, 0.1, 0.5]}"#).unwrap();
        assert_eq!(parsed.scores, vec![0.9, 0.1, 0.5]);
    }
}
