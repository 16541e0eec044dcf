//! Engine wiring
//!
//! Builds the store, the rate-limited client, both jobs and the scheduler
//! from one [`Config`]. The binary and the integration tests go through here.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::database::{SqliteStore, Store};
use crate::error::AppError;
use crate::otel::Metrics;
use crate::sync::{
    AdmissionFilter, InspectionSyncer, Job, OshaApi, RateLimitedClient, Scheduler,
    SchedulerHandle, SchedulerSettings, ViolationWatcher,
};

/// Fully wired ingestion engine
pub struct Engine {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
    handle: SchedulerHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    /// Open the database and build the HTTP client from configuration
    pub async fn new(config: &Config, metrics: Option<Arc<Metrics>>) -> Result<Self, AppError> {
        config.validate()?;

        let store = SqliteStore::new(&config.database.path).await?;
        info!(path = %config.database.path, "Database initialized");

        let mut client = RateLimitedClient::new(&config.api, &config.rate_limit)?;
        if let Some(metrics) = &metrics {
            client = client.with_metrics(Arc::clone(metrics));
        }
        info!(
            base_url = %config.api.base_url,
            pacing_ms = client.pacing().as_millis() as u64,
            "Rate-limited client initialized"
        );

        Self::with_parts(config, Arc::new(store), Arc::new(client), metrics)
    }

    /// Build the engine around an existing store and API
    pub fn with_parts(
        config: &Config,
        store: Arc<dyn Store>,
        api: Arc<dyn OshaApi>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, AppError> {
        let filter = AdmissionFilter::from_config(&config.ingest);
        info!(
            cutoff_year = filter.cutoff_year(),
            allowed_states = ?config.ingest.allowed_states,
            "Admission filter configured"
        );

        let mut syncer = InspectionSyncer::new(
            Arc::clone(&store),
            Arc::clone(&api),
            filter,
            &config.ingest,
        );
        let mut watcher = ViolationWatcher::new(Arc::clone(&store), api, &config.ingest);
        if let Some(metrics) = &metrics {
            syncer = syncer.with_metrics(Arc::clone(metrics));
            watcher = watcher.with_metrics(Arc::clone(metrics));
        }
        let jobs: Vec<Arc<dyn Job>> = vec![Arc::new(syncer), Arc::new(watcher)];

        let settings = SchedulerSettings::from_config(&config.schedule)?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut scheduler = Scheduler::new(settings, jobs, Arc::clone(&store), shutdown_rx);
        if let Some(metrics) = metrics {
            scheduler = scheduler.with_metrics(metrics);
        }
        let handle = scheduler.handle();

        Ok(Self {
            store,
            scheduler,
            handle,
            shutdown_tx,
        })
    }

    /// Handle for manual triggers, status and stop requests
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Run the scheduler until `signal` resolves, then stop and drain
    pub async fn run_until<F>(self, signal: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let scheduler = tokio::spawn(self.scheduler.run());

        signal.await;
        self.handle.request_stop();
        let _ = self.shutdown_tx.send(());

        scheduler
            .await
            .map_err(|e| AppError::Internal(format!("scheduler task failed: {}", e)))
    }
}
