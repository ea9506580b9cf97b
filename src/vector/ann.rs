//! Remote ANN adapter: `findNeighbors` / `upsertDatapoints` /
//! `removeDatapoints` against a deployed index endpoint, with a process-wide
//! cached bearer token.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::config::{DistanceMetric, VertexConfig};
use crate::core::error::{Error, Result};
use crate::vector::{parse_datapoint_id, VectorDatapoint, VectorIndex, VectorMatch};

/// Tokens are refreshed this far before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct RemoteAnnIndex {
    client: reqwest::Client,
    cfg: VertexConfig,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindNeighborsResponse {
    #[serde(default)]
    nearest_neighbors: Vec<NeighborList>,
}

#[derive(Deserialize)]
struct NeighborList {
    #[serde(default)]
    neighbors: Vec<Neighbor>,
}

#[derive(Deserialize)]
struct Neighbor {
    datapoint: NeighborDatapoint,
    #[serde(default)]
    distance: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NeighborDatapoint {
    datapoint_id: String,
}

impl RemoteAnnIndex {
    pub fn new(client: reqwest::Client, cfg: VertexConfig) -> Self {
        Self {
            client,
            cfg,
            token: RwLock::new(None),
        }
    }

    /// `{location}-aiplatform.googleapis.com` host derived from the endpoint
    /// resource path.
    fn api_base(&self) -> Result<String> {
        let resource = self
            .cfg
            .index_endpoint_resource
            .as_deref()
            .ok_or_else(|| Error::Config("VERTEX_INDEX_ENDPOINT_RESOURCE unset".into()))?;
        let location = resource
            .split('/')
            .nth(3)
            .ok_or_else(|| Error::Config("malformed index endpoint resource".into()))?;
        Ok(format!(
            "https://{}-aiplatform.googleapis.com/v1/{}",
            location, resource
        ))
    }

    async fn bearer_token(&self) -> Result<String> {
        {
            let guard = self.token.read().await;
            if let Some(cached) = guard.as_ref() {
                if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = guard.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let token_url = self
            .cfg
            .token_url
            .as_deref()
            .ok_or_else(|| Error::Config("VERTEX_TOKEN_URL unset".into()))?;
        let resp = self
            .client
            .get(token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("token fetch: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("token decode: {}", e)))?;

        let token = body.access_token.clone();
        *guard = Some(CachedToken {
            token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        });
        debug!("refreshed ANN bearer token");
        Ok(token)
    }

    /// Service distance → similarity in [0, 1].
    fn to_similarity(&self, distance: f32) -> f32 {
        match self.cfg.distance_metric {
            DistanceMetric::Cosine | DistanceMetric::DotProduct => {
                (1.0 - distance).clamp(0.0, 1.0)
            }
            DistanceMetric::SquaredL2 => 1.0 / (1.0 + distance.max(0.0)),
        }
    }

    async fn post(&self, verb: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}:{}", self.api_base()?, verb);
        let token = self.bearer_token().await?;
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{}: {}", verb, e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(format!("{} quota exhausted", verb)));
        }
        if !status.is_success() {
            return Err(Error::Upstream(format!("{} returned {}", verb, status)));
        }
        resp.json()
            .await
            .map_err(|e| Error::Upstream(format!("{} decode: {}", verb, e)))
    }
}

#[async_trait]
impl VectorIndex for RemoteAnnIndex {
    async fn search(&self, vector: &[f32], tenant_id: &str, k: usize) -> Result<Vec<VectorMatch>> {
        let deployed = self
            .cfg
            .deployed_index_id
            .as_deref()
            .ok_or_else(|| Error::Config("VERTEX_DEPLOYED_INDEX_ID unset".into()))?;

        let body = json!({
            "deployedIndexId": deployed,
            "queries": [{
                "datapoint": {
                    "featureVector": vector,
                    "restricts": [{
                        "namespace": "tenantId",
                        "allowList": [tenant_id],
                    }],
                },
                "neighborCount": k,
            }],
        });

        let raw = self.post("findNeighbors", body).await?;
        let parsed: FindNeighborsResponse = serde_json::from_value(raw)
            .map_err(|e| Error::Upstream(format!("findNeighbors shape: {}", e)))?;

        // Service rank is preserved: neighbors arrive best-first.
        let mut out = Vec::new();
        for list in parsed.nearest_neighbors {
            for n in list.neighbors {
                let Some((chunk_id, note_id)) = parse_datapoint_id(&n.datapoint.datapoint_id)
                else {
                    warn!(id = %n.datapoint.datapoint_id, "unparseable datapoint id from ANN");
                    continue;
                };
                out.push(VectorMatch {
                    chunk_id,
                    note_id,
                    score: self.to_similarity(n.distance),
                });
                if out.len() >= k {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn upsert(&self, datapoints: Vec<VectorDatapoint>) -> Result<()> {
        if datapoints.is_empty() {
            return Ok(());
        }
        let body = json!({
            "datapoints": datapoints.iter().map(|d| json!({
                "datapointId": d.datapoint_id,
                "featureVector": d.feature_vector,
                "restricts": [{
                    "namespace": "tenantId",
                    "allowList": [d.tenant_id],
                }],
            })).collect::<Vec<_>>(),
        });
        self.post("upsertDatapoints", body).await.map(|_| ())
    }

    async fn remove(&self, datapoint_ids: Vec<String>) -> Result<()> {
        if datapoint_ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "datapointIds": datapoint_ids });
        self.post("removeDatapoints", body).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "remote_ann"
    }

    fn is_configured(&self) -> bool {
        self.cfg.index_endpoint_resource.is_some()
            && self.cfg.deployed_index_id.is_some()
            && self.cfg.project.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(metric: DistanceMetric) -> RemoteAnnIndex {
        RemoteAnnIndex::new(
            reqwest::Client::new(),
            VertexConfig {
                index_endpoint_resource: Some(
                    "projects/p/locations/us-central1/indexEndpoints/42".into(),
                ),
                deployed_index_id: Some("dep".into()),
                project: Some("p".into()),
                distance_metric: metric,
                token_url: Some("http://metadata/token".into()),
                enabled: true,
            },
        )
    }

    #[test]
    fn api_base_uses_location_host() {
        let idx = index(DistanceMetric::Cosine);
        assert_eq!(
            idx.api_base().unwrap(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/p/locations/us-central1/indexEndpoints/42"
        );
    }

    #[test]
    fn distance_conversion_per_metric() {
        let cos = index(DistanceMetric::Cosine);
        assert!((cos.to_similarity(0.0) - 1.0).abs() < 1e-6);
        assert!((cos.to_similarity(0.3) - 0.7).abs() < 1e-6);
        assert_eq!(cos.to_similarity(1.5), 0.0);

        let l2 = index(DistanceMetric::SquaredL2);
        assert!((l2.to_similarity(0.0) - 1.0).abs() < 1e-6);
        assert!((l2.to_similarity(1.0) - 0.5).abs() < 1e-6);
        assert!(l2.to_similarity(9.0) > 0.0);
    }

    #[test]
    fn neighbors_response_parses() {
        let raw = serde_json::json!({
            "nearestNeighbors": [{
                "neighbors": [
                    {"datapoint": {"datapointId": "n1_000:n1"}, "distance": 0.2},
                    {"datapoint": {"datapointId": "n2_001:n2"}, "distance": 0.4},
                ]
            }]
        });
        let parsed: FindNeighborsResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.nearest_neighbors[0].neighbors.len(), 2);
        assert_eq!(
            parsed.nearest_neighbors[0].neighbors[0].datapoint.datapoint_id,
            "n1_000:n1"
        );
    }
}
