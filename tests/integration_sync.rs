//! Scheduler integration tests
//!
//! Tests the scheduling system including:
//! - Startup and interval firings
//! - Single-flight guard and skipped firings
//! - Manual triggers and status queries
//! - Graceful shutdown of the scheduler and the engine

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use wiremock::MockServer;

use common::{create_test_config, create_test_store, inspections_2024, FakeOsha};
use osha_ingest::database::Store;
use osha_ingest::engine::Engine;
use osha_ingest::error::SyncError;
use osha_ingest::models::{JobKind, RunStatus};
use osha_ingest::sync::scheduler::JobSchedule;
use osha_ingest::sync::{
    InspectionSyncReport, Job, JobReport, RunBounds, Scheduler, SchedulerSettings, StopReason,
    TriggerKind, ViolationSyncReport,
};

/// Test job counting its runs
struct CountingJob {
    kind: JobKind,
    delay: Duration,
    runs: Arc<AtomicU32>,
}

impl CountingJob {
    fn new(kind: JobKind, delay_ms: u64) -> Self {
        Self {
            kind,
            delay: Duration::from_millis(delay_ms),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    fn runs(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl Job for CountingJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, _bounds: &RunBounds, stop: &watch::Receiver<bool>) -> JobReport {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let mut stop = stop.clone();
        let stopped = async move {
            let _ = stop.wait_for(|s| *s).await;
        };
        let stop_reason = tokio::select! {
            _ = tokio::time::sleep(self.delay) => StopReason::Completed,
            _ = stopped => StopReason::Cancelled,
        };

        match self.kind {
            JobKind::InspectionSync => JobReport::InspectionSync(InspectionSyncReport {
                fetched: 100,
                stop_reason,
                ..Default::default()
            }),
            JobKind::ViolationWatch => JobReport::ViolationWatch(ViolationSyncReport {
                checked: 10,
                stop_reason,
                ..Default::default()
            }),
        }
    }
}

fn settings(interval: Duration, run_on_startup: bool) -> SchedulerSettings {
    SchedulerSettings {
        inspections: JobSchedule {
            interval,
            daily_at: None,
        },
        violations: JobSchedule {
            interval,
            daily_at: None,
        },
        run_on_startup,
        jitter_secs: 0,
    }
}

/// Test 1: Scheduler runs every job once on startup
#[tokio::test]
async fn test_scheduler_startup_runs() {
    let inspections = CountingJob::new(JobKind::InspectionSync, 0);
    let violations = CountingJob::new(JobKind::ViolationWatch, 0);
    let (a, b) = (inspections.runs(), violations.runs());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_secs(3600), true),
        vec![Arc::new(inspections) as Arc<dyn Job>, Arc::new(violations)],
        create_test_store().await,
        shutdown_rx,
    );
    let status = scheduler.handle();
    let handle = tokio::spawn(scheduler.run());

    // Wait for startup runs
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown_tx.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);

    let job = status.job_status(JobKind::InspectionSync).await.unwrap();
    assert_eq!(job.last_trigger, Some(TriggerKind::Startup));
    assert_eq!(job.runs, 1);
}

/// Test 2: Interval trigger keeps firing
#[tokio::test]
async fn test_scheduler_interval_runs() {
    let job = CountingJob::new(JobKind::InspectionSync, 0);
    let runs = job.runs();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_millis(100), false),
        vec![Arc::new(job) as Arc<dyn Job>],
        create_test_store().await,
        shutdown_rx,
    );
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(450)).await;

    shutdown_tx.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

    let count = runs.load(Ordering::SeqCst);
    assert!((2..=5).contains(&count), "unexpected run count {}", count);
}

/// Test 3: Firings during a long run are skipped, not queued
#[tokio::test]
async fn test_single_flight_skips_firings() {
    let job = CountingJob::new(JobKind::ViolationWatch, 350);
    let runs = job.runs();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_millis(100), false),
        vec![Arc::new(job) as Arc<dyn Job>],
        create_test_store().await,
        shutdown_rx,
    );
    let status = scheduler.handle();
    let handle = tokio::spawn(scheduler.run());

    // First firing at ~100ms runs until ~450ms
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let job = status.job_status(JobKind::ViolationWatch).await.unwrap();
    assert!(job.in_progress);
    assert!(job.skipped_firings >= 2);

    shutdown_tx.send(()).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}

/// Test 4: Manual trigger returns the report and is persisted
#[tokio::test]
async fn test_manual_trigger() {
    let store = create_test_store().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_secs(3600), false),
        vec![Arc::new(CountingJob::new(JobKind::InspectionSync, 0)) as Arc<dyn Job>],
        store.clone(),
        shutdown_rx,
    );

    let manual = scheduler.handle();
    let scheduler_handle = tokio::spawn(scheduler.run());

    let report = manual
        .trigger(JobKind::InspectionSync, RunBounds::records(100))
        .await
        .unwrap();
    assert_eq!(report.kind(), JobKind::InspectionSync);
    assert_eq!(report.status(), RunStatus::Succeeded);

    let run = store
        .last_job_run(JobKind::InspectionSync)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.trigger, "manual");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.details.unwrap().contains("\"fetched\":100"));

    shutdown_tx.send(()).unwrap();
    let _ = scheduler_handle.await;
}

/// Test 5: Manual trigger for an unknown job or a busy job
#[tokio::test]
async fn test_manual_trigger_errors() {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_secs(3600), false),
        vec![Arc::new(CountingJob::new(JobKind::InspectionSync, 300)) as Arc<dyn Job>],
        create_test_store().await,
        shutdown_rx,
    );

    let manual = scheduler.handle();
    let scheduler_handle = tokio::spawn(scheduler.run());

    let result = manual
        .trigger(JobKind::ViolationWatch, RunBounds::default())
        .await;
    assert!(matches!(result.unwrap_err(), SyncError::NotFound));

    let background = manual.clone();
    let running = tokio::spawn(async move {
        background
            .trigger(JobKind::InspectionSync, RunBounds::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let busy = manual
        .trigger(JobKind::InspectionSync, RunBounds::default())
        .await;
    assert!(matches!(busy.unwrap_err(), SyncError::JobBusy(_)));
    assert!(running.await.unwrap().is_ok());

    shutdown_tx.send(()).unwrap();
    let _ = scheduler_handle.await;
}

/// Test 6: Graceful shutdown cancels the running job and returns
#[tokio::test]
async fn test_graceful_shutdown() {
    let job = CountingJob::new(JobKind::InspectionSync, 60_000);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        settings(Duration::from_secs(3600), true),
        vec![Arc::new(job) as Arc<dyn Job>],
        create_test_store().await,
        shutdown_rx,
    );
    let status = scheduler.handle();
    let handle = tokio::spawn(scheduler.run());

    // Let the startup run begin
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Send shutdown
    shutdown_tx.send(()).unwrap();

    // Should complete within timeout
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(result.is_ok());

    let job = status.job_status(JobKind::InspectionSync).await.unwrap();
    let report = job.last_report.unwrap();
    assert_eq!(report.stop_reason(), &StopReason::Cancelled);
    assert_eq!(report.status(), RunStatus::Partial);
}

/// Test 7: Engine runs startup sync against the API and stops on signal
#[tokio::test]
async fn test_engine_run_until_signal() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let fake = FakeOsha::new(inspections_2024(30), vec![]);
    fake.mount(&server).await;

    let mut config = create_test_config(&server, &dir);
    config.schedule.run_on_startup = true;

    let engine = Engine::new(&config, None).await.unwrap();
    let store = engine.store();
    let handle = engine.handle();

    let signal = {
        let store = store.clone();
        async move {
            for _ in 0..100 {
                if store.count_inspections().await.unwrap_or(0) == 30 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    };

    let result = tokio::time::timeout(Duration::from_secs(5), engine.run_until(signal)).await;
    assert!(matches!(result, Ok(Ok(()))));
    assert!(handle.is_stopping());
    assert_eq!(store.count_inspections().await.unwrap(), 30);

    let run = store
        .last_job_run(JobKind::InspectionSync)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.trigger, "startup");
}
