//! Configuration management for osha-ingest
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Remote API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Outbound call pacing and backoff
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-run bounds and admission policy
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Job cadences
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix OSHA_INGEST_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(base_url) = std::env::var("OSHA_INGEST_API_BASE_URL") {
            config.api.base_url = base_url;
        }
        if let Ok(key) = std::env::var("OSHA_INGEST_API_KEY") {
            config.api.api_key = Some(key);
        }

        if let Ok(path) = std::env::var("OSHA_INGEST_DATABASE_PATH") {
            config.database.path = path;
        }

        if let Ok(year) = std::env::var("OSHA_INGEST_CUTOFF_YEAR") {
            config.ingest.cutoff_year = year
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid cutoff year".to_string()))?;
        }
        if let Ok(states) = std::env::var("OSHA_INGEST_ALLOWED_STATES") {
            config.ingest.allowed_states = states
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(flag) = std::env::var("OSHA_INGEST_RUN_ON_STARTUP") {
            config.schedule.run_on_startup = flag.parse().unwrap_or(false);
        }

        if let Ok(level) = std::env::var("OSHA_INGEST_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(enabled) = std::env::var("OSHA_INGEST_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("OSHA_INGEST_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        Ok(config)
    }

    /// Reject bounds and schedules the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("api.base_url".to_string()));
        }
        if self
            .api
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty())
        {
            return Err(ConfigError::MissingRequired("api.api_key".to_string()));
        }

        let ingest = &self.ingest;
        if ingest.page_size == 0 || ingest.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue(format!(
                "ingest.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, ingest.page_size
            )));
        }
        if ingest.max_records_per_run == 0 {
            return Err(ConfigError::InvalidValue(
                "ingest.max_records_per_run must be positive".to_string(),
            ));
        }
        if ingest.max_calls_per_run == 0 {
            return Err(ConfigError::InvalidValue(
                "ingest.max_calls_per_run must be positive".to_string(),
            ));
        }
        if ingest.max_inspections_per_run == 0 {
            return Err(ConfigError::InvalidValue(
                "ingest.max_inspections_per_run must be positive".to_string(),
            ));
        }
        if !(1970..=2100).contains(&ingest.cutoff_year) {
            return Err(ConfigError::InvalidValue(format!(
                "ingest.cutoff_year out of range: {}",
                ingest.cutoff_year
            )));
        }

        for (name, job) in [
            ("schedule.inspections", &self.schedule.inspections),
            ("schedule.violations", &self.schedule.violations),
        ] {
            if job.interval_secs == 0 || job.interval_secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::InvalidValue(format!(
                    "{}.interval_secs must be between 1 and {}: {}",
                    name, MAX_INTERVAL_SECS, job.interval_secs
                )));
            }
            job.daily_time()?;
        }

        Ok(())
    }
}

/// Largest page the remote API serves
pub const MAX_PAGE_SIZE: u32 = 200;

/// Longest accepted interval between scheduled runs (30 days)
pub const MAX_INTERVAL_SECS: u64 = 30 * 86_400;

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Base URL of the enforcement dataset, without the endpoint suffix
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent as `X-API-KEY`
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://apiprod.dol.gov/v4/get/OSHA".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

/// Pacing and backoff for every outbound call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Minimum spacing between the starts of two outbound calls (milliseconds)
    #[serde(default = "default_pacing_interval")]
    pub pacing_interval_ms: u64,

    /// Wait after a 429 or a transient failure before retrying (seconds)
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,

    /// Retries allowed for transient network failures
    #[serde(default = "default_max_network_retries")]
    pub max_network_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pacing_interval_ms: default_pacing_interval(),
            backoff_secs: default_backoff(),
            max_network_retries: default_max_network_retries(),
        }
    }
}

fn default_pacing_interval() -> u64 {
    3000
}

fn default_backoff() -> u64 {
    120
}

fn default_max_network_retries() -> u32 {
    2
}

/// Per-run bounds and admission policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Records requested per call
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Records fetched per inspection sync run
    #[serde(default = "default_max_records")]
    pub max_records_per_run: u32,

    /// Remote calls per inspection sync run
    #[serde(default = "default_max_calls")]
    pub max_calls_per_run: u32,

    /// Candidates checked per violation watcher run
    #[serde(default = "default_max_inspections")]
    pub max_inspections_per_run: u32,

    /// Minimum open_date year admitted into the store
    #[serde(default = "default_cutoff_year")]
    pub cutoff_year: i32,

    /// Two-letter state codes to admit; empty admits every state
    #[serde(default)]
    pub allowed_states: Vec<String>,

    /// Fetch violations for newly inserted inspections at the end of a sync run
    #[serde(default = "default_fetch_new_violations")]
    pub fetch_new_violations: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_records_per_run: default_max_records(),
            max_calls_per_run: default_max_calls(),
            max_inspections_per_run: default_max_inspections(),
            cutoff_year: default_cutoff_year(),
            allowed_states: Vec::new(),
            fetch_new_violations: default_fetch_new_violations(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}

fn default_max_records() -> u32 {
    5000
}

fn default_max_calls() -> u32 {
    50
}

fn default_max_inspections() -> u32 {
    100
}

fn default_cutoff_year() -> i32 {
    2020
}

fn default_fetch_new_violations() -> bool {
    true
}

/// Cadences for both jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Inspection sync cadence
    #[serde(default = "default_inspection_schedule")]
    pub inspections: JobScheduleConfig,

    /// Violation watcher cadence
    #[serde(default = "default_violation_schedule")]
    pub violations: JobScheduleConfig,

    /// Fire both jobs once as soon as the scheduler starts
    #[serde(default)]
    pub run_on_startup: bool,

    /// Random delay added to interval firings (seconds)
    #[serde(default)]
    pub jitter_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            inspections: default_inspection_schedule(),
            violations: default_violation_schedule(),
            run_on_startup: false,
            jitter_secs: 0,
        }
    }
}

/// Interval plus daily time-of-day trigger for one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobScheduleConfig {
    /// Interval between firings (seconds)
    pub interval_secs: u64,

    /// Daily firing time, `HH:MM` in UTC; absent disables the daily trigger
    pub daily_at: Option<String>,
}

impl JobScheduleConfig {
    /// Parse `daily_at` into a time of day
    pub fn daily_time(&self) -> Result<Option<NaiveTime>, ConfigError> {
        match self.daily_at.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue(format!("invalid daily_at: {}", raw))),
        }
    }
}

fn default_inspection_schedule() -> JobScheduleConfig {
    JobScheduleConfig {
        interval_secs: 3 * 3600,
        daily_at: Some("02:00".to_string()),
    }
}

fn default_violation_schedule() -> JobScheduleConfig {
    JobScheduleConfig {
        interval_secs: 6 * 3600,
        daily_at: Some("03:00".to_string()),
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "data/osha-ingest.db".to_string()
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Whether to use insecure connection
    #[serde(default)]
    pub insecure: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            insecure: false,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "osha-ingest".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
