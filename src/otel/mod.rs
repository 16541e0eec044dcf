//! Telemetry for osha-ingest
//!
//! Structured logging through `tracing`, plus optional OTLP export of spans
//! and ingestion metrics.

use std::time::Duration;

use crate::config::{LoggingConfig, OtelConfig};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as _,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Telemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Owner of the tracer and meter providers
///
/// When export is disabled the meter provider has no reader, so every
/// instrument is a no-op and no tracer provider is installed.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    service_name: String,
}

impl OtelProvider {
    /// Build providers from configuration
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::span_pipeline(endpoint, &resource)?;
            let meter_provider = Self::metric_pipeline(endpoint, &resource)?;
            global::set_tracer_provider(tracer_provider.clone());

            (Some(tracer_provider), meter_provider)
        } else {
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        Ok(Self {
            tracer_provider,
            meter_provider,
            service_name: config.service_name.clone(),
        })
    }

    fn span_pipeline(endpoint: &str, resource: &Resource) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(
                Config::default()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(resource.clone()),
            )
            .build())
    }

    fn metric_pipeline(endpoint: &str, resource: &Resource) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
            .build())
    }

    /// Tracer for the OpenTelemetry tracing layer
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    /// Meter for the ingestion instruments
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.service_name.clone())
    }

    /// Whether spans and metrics are exported
    pub fn is_enabled(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Flush and stop the providers
    pub fn shutdown(&self) -> Result<(), OtelError> {
        self.meter_provider
            .shutdown()
            .map_err(|e| OtelError::Shutdown(format!("Meter shutdown failed: {:?}", e)))?;

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                result
                    .map_err(|e| OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)))?;
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Ingestion metrics
pub struct Metrics {
    /// Outbound API calls by endpoint and outcome
    pub api_calls_total: Counter<u64>,

    /// Outbound API call latency in seconds
    pub api_call_duration: Histogram<f64>,

    /// Records handled by a job, by result (inserted, updated, rejected, ...)
    pub records_ingested_total: Counter<u64>,

    /// Violations stored for the first time
    pub violations_found_total: Counter<u64>,

    /// Finished job runs by status
    pub job_runs_total: Counter<u64>,

    /// Trigger firings skipped because the job was still running
    pub skipped_firings_total: Counter<u64>,
}

impl Metrics {
    /// Register the instruments on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            api_calls_total: meter
                .u64_counter("osha_ingest_api_calls_total")
                .with_description("Outbound API calls by endpoint and outcome")
                .init(),
            api_call_duration: meter
                .f64_histogram("osha_ingest_api_call_duration_seconds")
                .with_description("Outbound API call duration in seconds")
                .init(),
            records_ingested_total: meter
                .u64_counter("osha_ingest_records_total")
                .with_description("Remote records handled by job and result")
                .init(),
            violations_found_total: meter
                .u64_counter("osha_ingest_violations_found_total")
                .with_description("Violations stored for the first time")
                .init(),
            job_runs_total: meter
                .u64_counter("osha_ingest_job_runs_total")
                .with_description("Finished job runs by job and status")
                .init(),
            skipped_firings_total: meter
                .u64_counter("osha_ingest_skipped_firings_total")
                .with_description("Trigger firings skipped while the job was running")
                .init(),
        }
    }

    /// Record one outbound call attempt
    pub fn record_api_call(&self, endpoint: &str, outcome: &str, elapsed: Duration) {
        let attrs = [
            KeyValue::new("endpoint", endpoint.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.api_calls_total.add(1, &attrs);
        self.api_call_duration.record(elapsed.as_secs_f64(), &attrs);
    }

    /// Record `count` records with the same result
    pub fn record_records(&self, job: &str, result: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.records_ingested_total.add(
            count,
            &[
                KeyValue::new("job", job.to_string()),
                KeyValue::new("result", result.to_string()),
            ],
        );
    }

    /// Record newly stored violations
    pub fn record_violations_found(&self, job: &str, count: u64) {
        if count > 0 {
            self.violations_found_total
                .add(count, &[KeyValue::new("job", job.to_string())]);
        }
    }

    /// Record a finished run
    pub fn record_job_run(&self, job: &str, status: &str) {
        self.job_runs_total.add(
            1,
            &[
                KeyValue::new("job", job.to_string()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }

    /// Record a skipped trigger firing
    pub fn record_skipped_firing(&self, job: &str) {
        self.skipped_firings_total
            .add(1, &[KeyValue::new("job", job.to_string())]);
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global tracing subscriber
///
/// `logging.format` selects `json` (default) or `pretty` output; the
/// OpenTelemetry layer is added when export is enabled.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = LevelFilter::from_level(parse_level(&logging.level));
    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("osha-ingest")));
    let registry = tracing_subscriber::registry().with(filter).with(otel_layer);

    let result = if logging.format.eq_ignore_ascii_case("pretty") {
        registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    };

    result.map_err(|e| OtelError::TracerInit(e.to_string()))
}
