/*!
HISTORY - Historical query collaborator (request/response)

ROLE:
Seeds realtime buffers and serves historical charts. The engine only sees
the `HistorySource` trait; `HttpHistoryClient` is the production backend.

ENDPOINTS (relative to `history_base_url`):
- `GET /api/servers/{id}/metrics?family=..`      -> `[MetricPoint]`
- `GET /api/servers/{id}/monitor-results?..`     -> `[ProbeResult]`
- `GET /api/monitors/{id}/results?..`            -> `[ProbeResult]`

All three take `start`, `end` (RFC 3339), `interval` (seconds) and `limit`.
*/

use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::models::{Credential, MetricFamily, MetricPoint, ProbeResult, Sample, SourceKind, SourceRef};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("unsupported query: {0}")]
    Unsupported(String),
}

/// One bounded historical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub source: SourceRef,
    pub family: MetricFamily,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub interval: Option<Duration>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<Sample>, FetchError>;
}

/// Applies an optional deadline to a history request.
pub async fn with_timeout<F>(timeout: Option<Duration>, request: F) -> Result<Vec<Sample>, FetchError>
where
    F: Future<Output = Result<Vec<Sample>, FetchError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .map_err(|_| FetchError::Timeout(limit))?,
        None => request.await,
    }
}

pub struct HttpHistoryClient {
    client: reqwest::Client,
    base_url: String,
    credential: RwLock<Option<Credential>>,
}

impl HttpHistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: RwLock::new(None),
        }
    }

    /// Token sent with every request from now on; `None` for anonymous.
    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }

    fn url_for(&self, query: &HistoryQuery) -> Result<String, FetchError> {
        let id = query.source.id;
        match (query.source.kind, query.family.is_probe()) {
            (SourceKind::Server, false) => Ok(format!("{}/api/servers/{id}/metrics", self.base_url)),
            (SourceKind::Server, true) => Ok(format!("{}/api/servers/{id}/monitor-results", self.base_url)),
            (SourceKind::Monitor, true) => Ok(format!("{}/api/monitors/{id}/results", self.base_url)),
            (SourceKind::Monitor, false) => Err(FetchError::Unsupported(format!(
                "{} has no {} series",
                query.source, query.family
            ))),
        }
    }

    fn params_for(query: &HistoryQuery) -> Result<Vec<(&'static str, String)>, FetchError> {
        let format = |at: OffsetDateTime| at.format(&Rfc3339).map_err(|e| FetchError::Unsupported(e.to_string()));
        let mut params = vec![
            ("start", format(query.start)?),
            ("end", format(query.end)?),
        ];
        if !query.family.is_probe() {
            params.push(("family", query.family.as_str().to_string()));
        }
        if let Some(interval) = query.interval {
            params.push(("interval", interval.as_secs().max(1).to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        Ok(params)
    }
}

#[async_trait]
impl HistorySource for HttpHistoryClient {
    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<Sample>, FetchError> {
        let url = self.url_for(query)?;
        let params = Self::params_for(query)?;
        debug!(%url, source = %query.source, family = %query.family, "history request");

        let mut request = self.client.get(&url).query(&params);
        let credential = self.credential.read().clone();
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.token());
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Http(e.to_string()))?;
        let body = response.bytes().await.map_err(|e| FetchError::Http(e.to_string()))?;

        if query.family.is_probe() {
            let results: Vec<ProbeResult> =
                serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
            Ok(results.into_iter().map(Sample::Probe).collect())
        } else {
            let points: Vec<MetricPoint> =
                serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
            Ok(points.into_iter().map(Sample::Metric).collect())
        }
    }
}
