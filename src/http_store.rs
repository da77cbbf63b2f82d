//! HTTP-backed Context Store that calls a remote measurement index

use crate::error::StoreError;
use crate::store::{ContextStore, GeoPoint, RecordFilter, StoreHit, StoreHits, StoreStats};
use crate::types::FragmentKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct NearestRequest<'a> {
    lat: f64,
    lon: f64,
    radius_km: f64,
    filter: &'a RecordFilter,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct FilterRequest<'a> {
    filter: &'a RecordFilter,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct SimilarRequest<'a> {
    query: &'a str,
    filter: &'a RecordFilter,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct HitsResponse {
    hits: Vec<WireHit>,
    #[serde(default)]
    total_matches: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireHit {
    id: String,
    #[serde(default = "default_kind")]
    kind: FragmentKind,
    #[serde(default)]
    distance: f32,
    #[serde(default)]
    similarity: f32,
    #[serde(default)]
    exactness: f32,
    text: String,
}

fn default_kind() -> FragmentKind {
    FragmentKind::Record
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    record_count: usize,
    #[serde(default)]
    last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    connections: usize,
}

impl From<HitsResponse> for StoreHits {
    fn from(resp: HitsResponse) -> Self {
        let total_matches = resp.total_matches.unwrap_or(resp.hits.len());
        let hits = resp
            .hits
            .into_iter()
            .map(|h| StoreHit {
                source_id: h.id,
                kind: h.kind,
                distance: h.distance,
                similarity: h.similarity.clamp(0.0, 1.0),
                exactness: h.exactness.clamp(0.0, 1.0),
                payload: h.text,
            })
            .collect();
        StoreHits { hits, total_matches }
    }
}

/// Context Store reached over HTTP
pub struct HttpContextStore {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpContextStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn map_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_decode() {
            StoreError::InvalidRequest(format!("malformed store response: {}", err))
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }

    async fn post_hits<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<StoreHits, StoreError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Calling context store at {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                StoreError::InvalidRequest(format!("{}: {}", status, body))
            } else {
                StoreError::Unavailable(format!("{}: {}", status, body))
            });
        }

        let hits: HitsResponse = response.json().await.map_err(|e| self.map_error(e))?;
        debug!("Context store returned {} hits", hits.hits.len());
        Ok(hits.into())
    }
}

#[async_trait]
impl ContextStore for HttpContextStore {
    fn name(&self) -> &str {
        "http_store"
    }

    async fn nearest(
        &self,
        center: GeoPoint,
        radius_km: f64,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<StoreHits, StoreError> {
        let req = NearestRequest {
            lat: center.lat,
            lon: center.lon,
            radius_km,
            filter,
            limit,
        };
        self.post_hits("nearest", &req).await
    }

    async fn filter(&self, filter: &RecordFilter, limit: usize) -> Result<StoreHits, StoreError> {
        self.post_hits("filter", &FilterRequest { filter, limit }).await
    }

    async fn similar(&self, text: &str, filter: &RecordFilter, k: usize) -> Result<StoreHits, StoreError> {
        self.post_hits("similar", &SimilarRequest { query: text, filter, k }).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let url = format!("{}/stats", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Ok(StoreStats {
                record_count: 0,
                last_refresh: None,
                connections: 0,
                healthy: false,
            });
        }
        let stats: StatsResponse = response.json().await.map_err(|e| self.map_error(e))?;
        Ok(StoreStats {
            record_count: stats.record_count,
            last_refresh: stats.last_refresh,
            connections: stats.connections,
            healthy: true,
        })
    }
}
