//! Job scheduler
//!
//! Each job has an interval trigger and an optional daily trigger (UTC time
//! of day), each driven by its own task. A job owns a single-flight guard: a
//! firing that finds the job running is skipped and counted, never queued.
//! The two jobs may run at the same time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{JobReport, RunBounds};
use crate::config::{ConfigError, ScheduleConfig, MAX_INTERVAL_SECS};
use crate::database::Store;
use crate::error::{DbError, SyncError};
use crate::models::{JobKind, JobRun, SyncWatermark};
use crate::otel::Metrics;

/// A unit of scheduled work
#[async_trait]
pub trait Job: Send + Sync {
    /// Which job this is
    fn kind(&self) -> JobKind;

    /// Run once; failures are reported in the returned report
    async fn execute(&self, bounds: &RunBounds, stop: &watch::Receiver<bool>) -> JobReport;
}

/// What fired a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Interval,
    Daily,
    Startup,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Interval => "interval",
            TriggerKind::Daily => "daily",
            TriggerKind::Startup => "startup",
            TriggerKind::Manual => "manual",
        }
    }
}

/// Triggers of one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSchedule {
    pub interval: Duration,
    pub daily_at: Option<NaiveTime>,
}

/// Resolved scheduler settings
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub inspections: JobSchedule,
    pub violations: JobSchedule,
    /// Fire both jobs once when the scheduler starts
    pub run_on_startup: bool,
    /// Random delay (0..=jitter_secs) before each interval or daily firing
    pub jitter_secs: u64,
}

impl SchedulerSettings {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            inspections: JobSchedule {
                interval: Duration::from_secs(config.inspections.interval_secs),
                daily_at: config.inspections.daily_time()?,
            },
            violations: JobSchedule {
                interval: Duration::from_secs(config.violations.interval_secs),
                daily_at: config.violations.daily_time()?,
            },
            run_on_startup: config.run_on_startup,
            jitter_secs: config.jitter_secs,
        })
    }

    fn schedule(&self, kind: JobKind) -> &JobSchedule {
        match kind {
            JobKind::InspectionSync => &self.inspections,
            JobKind::ViolationWatch => &self.violations,
        }
    }
}

/// In-memory status of one job
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    pub in_progress: bool,
    pub last_trigger: Option<TriggerKind>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_report: Option<JobReport>,
    /// Runs finished since process start
    pub runs: u64,
    /// Trigger firings dropped because the job was still running
    pub skipped_firings: u64,
    pub next_interval_fire: Option<DateTime<Utc>>,
    pub next_daily_fire: Option<DateTime<Utc>>,
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub jobs: BTreeMap<JobKind, JobStatus>,
    pub watermark: Option<SyncWatermark>,
    pub inspections: u64,
    pub violations: u64,
    /// Last persisted run per job, including runs of earlier processes
    pub last_runs: BTreeMap<JobKind, JobRun>,
}

/// Next occurrence of `at` strictly after `now`
pub fn next_daily_fire(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

struct JobSlot {
    job: Arc<dyn Job>,
    guard: Arc<Mutex<()>>,
}

/// State shared by trigger tasks and handles
#[derive(Clone)]
struct Runner {
    slots: Arc<BTreeMap<JobKind, JobSlot>>,
    status: Arc<RwLock<BTreeMap<JobKind, JobStatus>>>,
    store: Arc<dyn Store>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    metrics: Option<Arc<Metrics>>,
}

impl Runner {
    fn is_stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run a job now unless it is already running
    async fn fire(
        &self,
        kind: JobKind,
        trigger: TriggerKind,
        bounds: RunBounds,
    ) -> Result<JobReport, SyncError> {
        let slot = self.slots.get(&kind).ok_or(SyncError::NotFound)?;
        let _running = slot
            .guard
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::JobBusy(kind.to_string()))?;

        let started_at = Utc::now();
        {
            let mut status = self.status.write().await;
            let entry = status.entry(kind).or_default();
            entry.in_progress = true;
            entry.last_trigger = Some(trigger);
            entry.last_started = Some(started_at);
        }

        info!(job = %kind, trigger = trigger.as_str(), "Job started");
        let report = slot.job.execute(&bounds, &self.stop_rx).await;
        let finished_at = Utc::now();
        let status = report.status();

        let run = JobRun {
            id: None,
            job: kind,
            status,
            trigger: trigger.as_str().to_string(),
            started_at,
            finished_at,
            details: serde_json::to_string(&report).ok(),
            error: report.stop_reason().error_message(),
        };
        if let Err(e) = self.store.record_job_run(&run).await {
            warn!(job = %kind, error = %e, "Failed to persist job run");
        }

        {
            let mut status_map = self.status.write().await;
            let entry = status_map.entry(kind).or_default();
            entry.in_progress = false;
            entry.last_finished = Some(finished_at);
            entry.last_report = Some(report.clone());
            entry.runs += 1;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_job_run(kind.as_str(), &status.to_string());
        }
        info!(
            job = %kind,
            trigger = trigger.as_str(),
            status = %status,
            stop_reason = ?report.stop_reason(),
            calls = report.calls(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Job finished"
        );

        Ok(report)
    }

    /// Trigger-driven firing: optional jitter, busy firings are counted
    async fn fire_scheduled(&self, kind: JobKind, trigger: TriggerKind, jitter_secs: u64) {
        if jitter_secs > 0 {
            let delay = rand::thread_rng().gen_range(0..=jitter_secs);
            let mut stop = self.stop_rx.clone();
            let stopped = async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = stopped => return,
            }
        }
        if self.is_stopping() {
            return;
        }

        match self.fire(kind, trigger, RunBounds::default()).await {
            Ok(_) => {}
            Err(SyncError::JobBusy(_)) => {
                self.status
                    .write()
                    .await
                    .entry(kind)
                    .or_default()
                    .skipped_firings += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_skipped_firing(kind.as_str());
                }
                info!(job = %kind, trigger = trigger.as_str(), "Job still running, firing skipped");
            }
            Err(e) => warn!(job = %kind, error = %e, "Firing failed"),
        }
    }

    async fn set_next_fire(&self, kind: JobKind, trigger: TriggerKind, at: DateTime<Utc>) {
        let mut status = self.status.write().await;
        let entry = status.entry(kind).or_default();
        match trigger {
            TriggerKind::Daily => entry.next_daily_fire = Some(at),
            _ => entry.next_interval_fire = Some(at),
        }
    }
}

/// Drives both jobs until shutdown
pub struct Scheduler {
    settings: SchedulerSettings,
    runner: Runner,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Scheduler {
    /// Create a scheduler for `jobs`
    ///
    /// On shutdown the stop signal seen by running jobs is raised and the
    /// scheduler waits for in-flight scheduled runs to finish their current
    /// unit of work.
    pub fn new(
        settings: SchedulerSettings,
        jobs: Vec<Arc<dyn Job>>,
        store: Arc<dyn Store>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let slots: BTreeMap<_, _> = jobs
            .into_iter()
            .map(|job| {
                (
                    job.kind(),
                    JobSlot {
                        job,
                        guard: Arc::new(Mutex::new(())),
                    },
                )
            })
            .collect();
        let status = slots
            .keys()
            .map(|kind| (*kind, JobStatus::default()))
            .collect();

        Self {
            settings,
            runner: Runner {
                slots: Arc::new(slots),
                status: Arc::new(RwLock::new(status)),
                store,
                stop_tx: Arc::new(stop_tx),
                stop_rx,
                metrics: None,
            },
            shutdown_rx,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.runner.metrics = Some(metrics);
        self
    }

    /// Handle for manual triggers and status queries
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            runner: self.runner.clone(),
        }
    }

    /// Run until the shutdown signal
    pub async fn run(mut self) {
        let kinds: Vec<JobKind> = self.runner.slots.keys().copied().collect();
        info!(jobs = kinds.len(), "Starting scheduler");

        let (task_shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = JoinSet::new();

        for kind in &kinds {
            let schedule = self.settings.schedule(*kind).clone();

            tasks.spawn(interval_trigger(
                self.runner.clone(),
                *kind,
                schedule.interval,
                self.settings.jitter_secs,
                task_shutdown_tx.subscribe(),
            ));

            if let Some(at) = schedule.daily_at {
                tasks.spawn(daily_trigger(
                    self.runner.clone(),
                    *kind,
                    at,
                    self.settings.jitter_secs,
                    task_shutdown_tx.subscribe(),
                ));
            }

            if self.settings.run_on_startup {
                let runner = self.runner.clone();
                let kind = *kind;
                tasks.spawn(async move {
                    runner.fire_scheduled(kind, TriggerKind::Startup, 0).await;
                });
            }
        }

        // A closed channel means the owner is gone; treat it as shutdown
        let _ = self.shutdown_rx.recv().await;
        info!("Shutdown signal received, stopping scheduler");

        self.runner.stop_tx.send_replace(true);
        let _ = task_shutdown_tx.send(());

        while tasks.join_next().await.is_some() {}

        info!("Scheduler stopped");
    }
}

async fn interval_trigger(
    runner: Runner,
    kind: JobKind,
    period: Duration,
    jitter_secs: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let period = period.min(Duration::from_secs(MAX_INTERVAL_SECS));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight = JoinSet::new();

    loop {
        runner
            .set_next_fire(kind, TriggerKind::Interval, next_after(period))
            .await;

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = timer.tick() => {
                debug!(job = %kind, "Interval trigger fired");
                let runner = runner.clone();
                in_flight.spawn(async move {
                    runner.fire_scheduled(kind, TriggerKind::Interval, jitter_secs).await;
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!(job = %kind, "Interval trigger stopped");
}

async fn daily_trigger(
    runner: Runner,
    kind: JobKind,
    at: NaiveTime,
    jitter_secs: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        let now = Utc::now();
        let next = next_daily_fire(now, at);
        runner.set_next_fire(kind, TriggerKind::Daily, next).await;
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(wait) => {
                debug!(job = %kind, at = %at, "Daily trigger fired");
                let runner = runner.clone();
                in_flight.spawn(async move {
                    runner.fire_scheduled(kind, TriggerKind::Daily, jitter_secs).await;
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!(job = %kind, "Daily trigger stopped");
}

fn next_after(period: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Manual trigger and status surface
#[derive(Clone)]
pub struct SchedulerHandle {
    runner: Runner,
}

impl SchedulerHandle {
    /// Run a job now with explicit bounds
    ///
    /// Returns [`SyncError::JobBusy`] if the job is already running.
    pub async fn trigger(&self, kind: JobKind, bounds: RunBounds) -> Result<JobReport, SyncError> {
        self.runner.fire(kind, TriggerKind::Manual, bounds).await
    }

    /// In-memory status of one job
    pub async fn job_status(&self, kind: JobKind) -> Option<JobStatus> {
        self.runner.status.read().await.get(&kind).cloned()
    }

    /// Job status plus watermark, counts and persisted runs
    pub async fn status(&self) -> Result<EngineStatus, DbError> {
        let jobs = self.runner.status.read().await.clone();
        let store = &self.runner.store;

        let mut last_runs = BTreeMap::new();
        for kind in jobs.keys() {
            if let Some(run) = store.last_job_run(*kind).await? {
                last_runs.insert(*kind, run);
            }
        }

        Ok(EngineStatus {
            jobs,
            watermark: store.get_watermark().await?,
            inspections: store.count_inspections().await?,
            violations: store.count_violations().await?,
            last_runs,
        })
    }

    /// Raise the stop signal; running jobs end after their current unit
    pub fn request_stop(&self) {
        self.runner.stop_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        self.runner.is_stopping()
    }
}
