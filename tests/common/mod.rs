//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use osha_ingest::config::{Config, JobScheduleConfig, ScheduleConfig};
use osha_ingest::database::SqliteStore;

/// Create an in-memory store for testing
pub async fn create_test_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::in_memory()
            .await
            .expect("Failed to create test store"),
    )
}

/// Configuration pointing at `server` with a database inside `dir`
///
/// Pacing is 10ms and backoff zero so runs stay fast; schedules are long
/// enough that no trigger fires during a test.
pub fn create_test_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.api.api_key = Some("test-key".to_string());
    config.api.request_timeout_secs = 5;
    config.rate_limit.pacing_interval_ms = 10;
    config.rate_limit.backoff_secs = 0;
    config.rate_limit.max_network_retries = 1;
    config.ingest.page_size = 100;
    config.ingest.cutoff_year = 2020;
    config.database.path = dir
        .path()
        .join("osha.db")
        .to_string_lossy()
        .into_owned();
    config.schedule = ScheduleConfig {
        inspections: JobScheduleConfig {
            interval_secs: 86_400,
            daily_at: None,
        },
        violations: JobScheduleConfig {
            interval_secs: 86_400,
            daily_at: None,
        },
        run_on_startup: false,
        jitter_secs: 0,
    };
    config
}

/// Remote inspection as served by the API
pub fn inspection(activity_nr: &str, open_date: &str, load_dt: &str) -> Value {
    json!({
        "activity_nr": activity_nr,
        "estab_name": format!("Establishment {}", activity_nr),
        "site_state": "GA",
        "open_date": open_date,
        "load_dt": load_dt,
    })
}

/// Remote violation as served by the API
pub fn violation(activity_nr: &str, citation_id: &str, penalty: f64) -> Value {
    json!({
        "activity_nr": activity_nr,
        "citation_id": citation_id,
        "viol_type": "S",
        "current_penalty": penalty,
        "initial_penalty": penalty,
    })
}

/// `n` inspections opened in 2024 with increasing load_dt
pub fn inspections_2024(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            inspection(
                &format!("{}", 100_000 + i),
                "2024-06-01",
                &format!(
                    "2025-01-{:02} {:02}:{:02}:00",
                    1 + i / 1440,
                    (i / 60) % 24,
                    i % 60
                ),
            )
        })
        .collect()
}

/// In-process imitation of the enforcement API
///
/// Serves inspections sorted by load_dt honoring `gt`/`ge` filters, offset and
/// limit, and violations filtered by `eq` or `in` on activity_nr. Queued
/// status codes are answered before real data, one per request.
#[derive(Clone, Default)]
pub struct FakeOsha {
    inspections: Arc<Mutex<Vec<Value>>>,
    violations: Arc<Mutex<Vec<Value>>>,
    failures: Arc<Mutex<VecDeque<u16>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeOsha {
    pub fn new(inspections: Vec<Value>, violations: Vec<Value>) -> Self {
        let fake = Self::default();
        fake.set_inspections(inspections);
        *fake.violations.lock().unwrap() = violations;
        fake
    }

    pub fn set_inspections(&self, mut inspections: Vec<Value>) {
        inspections.sort_by(|a, b| a["load_dt"].as_str().cmp(&b["load_dt"].as_str()));
        *self.inspections.lock().unwrap() = inspections;
    }

    pub fn add_violation(&self, violation: Value) {
        self.violations.lock().unwrap().push(violation);
    }

    /// Answer the next request with `status` and no body
    pub fn fail_next(&self, status: u16) {
        self.failures.lock().unwrap().push_back(status);
    }

    /// Request paths received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, endpoint: &str) -> usize {
        self.requests()
            .iter()
            .filter(|p| p.as_str() == endpoint)
            .count()
    }

    /// Mount both endpoints on `server`
    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/inspection/json"))
            .respond_with(self.clone())
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/violation/json"))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn query(request: &Request, key: &str) -> Option<String> {
        request
            .url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn window(records: Vec<Value>, request: &Request) -> Vec<Value> {
        let offset = Self::query(request, "offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0usize);
        let limit = Self::query(request, "limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(usize::MAX);
        records.into_iter().skip(offset).take(limit).collect()
    }

    fn serve_inspections(&self, request: &Request) -> Vec<Value> {
        let filter: Value = Self::query(request, "filter_object")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null);
        let bound = filter["value"].as_str().map(str::to_string);
        let inclusive = filter["operator"].as_str() == Some("ge");

        let matching = self
            .inspections
            .lock()
            .unwrap()
            .iter()
            .filter(|r| match (&bound, r["load_dt"].as_str()) {
                (Some(bound), Some(dt)) if inclusive => dt >= bound.as_str(),
                (Some(bound), Some(dt)) => dt > bound.as_str(),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        Self::window(matching, request)
    }

    fn serve_violations(&self, request: &Request) -> Vec<Value> {
        let filter: Value = Self::query(request, "filter_object")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null);
        let wanted: Vec<String> = match &filter["value"] {
            Value::String(one) => vec![one.clone()],
            Value::Array(many) => many
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut matching: Vec<Value> = self
            .violations
            .lock()
            .unwrap()
            .iter()
            .filter(|v| {
                v["activity_nr"]
                    .as_str()
                    .is_some_and(|nr| wanted.iter().any(|w| w == nr))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a["citation_id"].as_str().cmp(&b["citation_id"].as_str()));
        Self::window(matching, request)
    }
}

impl Respond for FakeOsha {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let endpoint = request.url.path().to_string();
        self.requests.lock().unwrap().push(endpoint.clone());

        if let Some(status) = self.failures.lock().unwrap().pop_front() {
            return ResponseTemplate::new(status);
        }

        let data = if endpoint.starts_with("/violation") {
            self.serve_violations(request)
        } else {
            self.serve_inspections(request)
        };
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}
