//! Rate-limited client for the OSHA enforcement API
//!
//! Every outbound call goes through one pacing gate: a mutex held for the
//! whole call, including the pacing wait, retries and any 429 cooldown. At
//! most one request is in flight and consecutive request starts are at least
//! `pacing_interval_ms` apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::{CallOutcome, CallState, RetryPolicy};
use crate::config::{ApiConfig, RateLimitConfig};
use crate::error::SyncError;
use crate::otel::Metrics;

/// Most activity numbers sent in one `in` filter
pub const MAX_BATCH_ACTIVITY_NRS: usize = 100;

/// One page request against the inspection dataset
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionQuery {
    /// Only records published at or after this instant
    pub published_since: Option<DateTime<Utc>>,
    /// Page offset
    pub offset: u32,
    /// Page size
    pub limit: u32,
}

/// One page request against the violation dataset
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationQuery {
    /// Inspections whose violations are wanted
    pub activity_nrs: Vec<String>,
    /// Page offset
    pub offset: u32,
    /// Page size
    pub limit: u32,
}

impl ViolationQuery {
    /// First page for a single inspection
    pub fn single(activity_nr: impl Into<String>, limit: u32) -> Self {
        Self {
            activity_nrs: vec![activity_nr.into()],
            offset: 0,
            limit,
        }
    }
}

/// Remote API used by the syncer and the watcher
///
/// Pages are returned as raw JSON records; turning them into domain records
/// is left to the caller so malformed rows can be counted and skipped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OshaApi: Send + Sync {
    /// Fetch one page of inspections, ascending by publication timestamp
    async fn fetch_inspections(&self, query: &InspectionQuery) -> Result<Vec<Value>, SyncError>;

    /// Fetch one page of violations for the given inspections
    async fn fetch_violations(&self, query: &ViolationQuery) -> Result<Vec<Value>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Inspection,
    Violation,
}

impl Endpoint {
    fn path(&self) -> &'static str {
        match self {
            Endpoint::Inspection => "inspection/json",
            Endpoint::Violation => "violation/json",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Endpoint::Inspection => "inspection",
            Endpoint::Violation => "violation",
        }
    }
}

/// HTTP implementation of [`OshaApi`]
pub struct RateLimitedClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    pacing: Duration,
    policy: RetryPolicy,
    /// Start of the previous request; the lock is the pacing gate
    gate: Mutex<Option<Instant>>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("base_url", &self.base_url)
            .field("pacing", &self.pacing)
            .field("policy", &self.policy)
            .finish()
    }
}

impl RateLimitedClient {
    /// Create a client from API and rate limit settings
    pub fn new(api: &ApiConfig, rate_limit: &RateLimitConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, api, rate_limit))
    }

    /// Create a client around an existing reqwest Client
    pub fn with_client(client: Client, api: &ApiConfig, rate_limit: &RateLimitConfig) -> Self {
        Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            pacing: Duration::from_millis(rate_limit.pacing_interval_ms),
            policy: RetryPolicy::from_config(rate_limit),
            gate: Mutex::new(None),
            metrics: None,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Minimum spacing between request starts
    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Run one logical call through the gate and the retry state machine
    async fn call(
        &self,
        endpoint: Endpoint,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, SyncError> {
        let mut last_start = self.gate.lock().await;
        let mut state = CallState::Idle.begin();

        loop {
            if let Some(wait) = state.wait(&self.policy) {
                warn!(
                    endpoint = endpoint.label(),
                    state = ?state,
                    wait_secs = wait.as_secs(),
                    "Backing off before retry"
                );
                tokio::time::sleep(wait).await;
                state = state.resume();
                continue;
            }

            if let Some(previous) = *last_start {
                let elapsed = previous.elapsed();
                if elapsed < self.pacing {
                    let wait = self.pacing - elapsed;
                    debug!(wait_ms = wait.as_millis() as u64, "Pacing outbound call");
                    tokio::time::sleep(wait).await;
                }
            }
            let started = Instant::now();
            *last_start = Some(started);

            let result = self.send(endpoint, params).await;
            let outcome = CallOutcome::classify(&result);
            let elapsed = started.elapsed();

            match &result {
                Ok(records) => info!(
                    endpoint = endpoint.label(),
                    outcome = outcome.label(),
                    records = records.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "API call"
                ),
                Err(e) => warn!(
                    endpoint = endpoint.label(),
                    outcome = outcome.label(),
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "API call"
                ),
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_api_call(endpoint.label(), outcome.label(), elapsed);
            }

            state = state.on_outcome(outcome, &self.policy);
            match result {
                Ok(records) => return Ok(records),
                Err(e) if state.is_terminal() => return Err(e),
                Err(_) => {}
            }
        }
    }

    /// A single HTTP request with status mapping
    async fn send(
        &self,
        endpoint: Endpoint,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, SyncError> {
        let url = format!("{}/{}", self.base_url, endpoint.path());
        let mut request = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }

        let response = request.send().await.map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            status if status.is_success() => {
                let body = response.text().await.map_err(transport_error)?;
                parse_page(&body)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(SyncError::RateLimited(self.policy.backoff.as_secs())),
            StatusCode::NOT_FOUND if endpoint == Endpoint::Violation => Ok(Vec::new()),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
            status => Err(SyncError::ServerError(status.as_u16())),
        }
    }
}

#[async_trait]
impl OshaApi for RateLimitedClient {
    async fn fetch_inspections(&self, query: &InspectionQuery) -> Result<Vec<Value>, SyncError> {
        let mut params = vec![
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
            ("sort_by", "load_dt".to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(since) = query.published_since {
            params.push((
                "filter_object",
                json!({
                    "field": "load_dt",
                    "operator": "ge",
                    "value": since.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .to_string(),
            ));
        }

        self.call(Endpoint::Inspection, &params).await
    }

    async fn fetch_violations(&self, query: &ViolationQuery) -> Result<Vec<Value>, SyncError> {
        let filter = match query.activity_nrs.as_slice() {
            [] => return Ok(Vec::new()),
            [single] => json!({"field": "activity_nr", "operator": "eq", "value": single}),
            many if many.len() <= MAX_BATCH_ACTIVITY_NRS => {
                json!({"field": "activity_nr", "operator": "in", "value": many})
            }
            many => {
                return Err(SyncError::InvalidData(format!(
                    "{} activity numbers in one request (max {})",
                    many.len(),
                    MAX_BATCH_ACTIVITY_NRS
                )))
            }
        };

        let params = [
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
            ("filter_object", filter.to_string()),
            ("sort_by", "citation_id".to_string()),
            ("sort", "asc".to_string()),
        ];

        self.call(Endpoint::Violation, &params).await
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::NetworkTimeout
    } else if e.is_connect() {
        SyncError::ConnectionRefused
    } else {
        SyncError::Network(e.to_string())
    }
}

/// Parse a response body: `{"data": [...]}`, a bare array, or nothing
fn parse_page(body: &str) -> Result<Vec<Value>, SyncError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| SyncError::InvalidData(format!("response is not JSON: {}", e)))?;

    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(records)) => Ok(records),
            Some(Value::Null) => Ok(Vec::new()),
            None if obj.is_empty() => Ok(Vec::new()),
            _ => Err(SyncError::InvalidData(
                "response has no data array".to_string(),
            )),
        },
        _ => Err(SyncError::InvalidData(
            "unexpected response shape".to_string(),
        )),
    }
}
