//! Violation watcher
//!
//! Violations are published months after the inspection they belong to, so
//! stored inspections are rechecked in priority tiers: first those inside the
//! citation window with nothing found yet, then open cases that already have
//! citations, then everything else, least recently checked first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::http_client::{OshaApi, ViolationQuery};
use super::scheduler::Job;
use super::{JobReport, RunBounds, StopReason};
use crate::config::IngestConfig;
use crate::database::Store;
use crate::error::SyncError;
use crate::models::{JobKind, ViolationCandidate, ViolationRecord};
use crate::otel::Metrics;

/// Outcome of one violation watcher run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationSyncReport {
    /// Candidates selected
    pub candidates: u32,
    /// Candidates whose check was recorded
    pub checked: u32,
    /// Violations stored for the first time
    pub new_violations_found: u32,
    /// Violations already stored
    pub duplicates: u32,
    /// Violation rows that could not be parsed
    pub malformed: u32,
    /// Checked inspections that gained at least one violation
    pub inspections_with_new_violations: u32,
    /// Remote calls made
    pub calls: u32,
    pub stop_reason: StopReason,
}

/// Rechecks stored inspections for newly issued violations
pub struct ViolationWatcher {
    store: Arc<dyn Store>,
    api: Arc<dyn OshaApi>,
    page_size: u32,
    max_inspections: u32,
    metrics: Option<Arc<Metrics>>,
}

impl ViolationWatcher {
    pub fn new(store: Arc<dyn Store>, api: Arc<dyn OshaApi>, config: &IngestConfig) -> Self {
        Self {
            store,
            api,
            page_size: config.page_size.max(1),
            max_inspections: config.max_inspections_per_run,
            metrics: None,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one watch using today's UTC date for the citation window
    pub async fn run(&self, bounds: &RunBounds, stop: &watch::Receiver<bool>) -> ViolationSyncReport {
        self.run_on(Utc::now().date_naive(), bounds, stop).await
    }

    /// Run one watch as of `today`
    pub async fn run_on(
        &self,
        today: NaiveDate,
        bounds: &RunBounds,
        stop: &watch::Receiver<bool>,
    ) -> ViolationSyncReport {
        let limit = bounds.max_inspections.unwrap_or(self.max_inspections);
        let mut report = ViolationSyncReport::default();

        let candidates = match self.store.select_violation_candidates(today, limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                report.stop_reason = StopReason::StoreError(e.to_string());
                return report;
            }
        };
        report.candidates = candidates.len() as u32;

        info!(
            today = %today,
            candidates = report.candidates,
            "Starting violation watch"
        );

        report.stop_reason = self.check_all(&candidates, stop, &mut report).await;
        self.record_metrics(&report);

        info!(
            candidates = report.candidates,
            checked = report.checked,
            new_violations = report.new_violations_found,
            duplicates = report.duplicates,
            malformed = report.malformed,
            inspections_with_new_violations = report.inspections_with_new_violations,
            calls = report.calls,
            stop_reason = ?report.stop_reason,
            "Violation watch finished"
        );

        report
    }

    async fn check_all(
        &self,
        candidates: &[ViolationCandidate],
        stop: &watch::Receiver<bool>,
        report: &mut ViolationSyncReport,
    ) -> StopReason {
        for candidate in candidates {
            if *stop.borrow() {
                return StopReason::Cancelled;
            }

            let violations = match self.fetch_all(&candidate.activity_nr, report).await {
                Ok(violations) => violations,
                Err(e) => {
                    warn!(
                        activity_nr = %candidate.activity_nr,
                        error = %e,
                        "Violation lookup failed, abandoning remaining candidates"
                    );
                    return StopReason::from_client(&e);
                }
            };

            let outcome = match self
                .store
                .record_violation_check(&candidate.activity_nr, &violations, Utc::now())
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => return StopReason::StoreError(e.to_string()),
            };

            report.checked += 1;
            report.new_violations_found += outcome.inserted;
            report.duplicates += outcome.duplicates;

            if outcome.inserted > 0 {
                report.inspections_with_new_violations += 1;
                info!(
                    activity_nr = %candidate.activity_nr,
                    tier = ?candidate.tier,
                    new_violations = outcome.inserted,
                    "New violations found"
                );
            } else {
                debug!(
                    activity_nr = %candidate.activity_nr,
                    tier = ?candidate.tier,
                    "No new violations"
                );
            }
        }

        StopReason::Completed
    }

    /// Fetch every violation page of one inspection
    async fn fetch_all(
        &self,
        activity_nr: &str,
        report: &mut ViolationSyncReport,
    ) -> Result<Vec<ViolationRecord>, SyncError> {
        let mut violations = Vec::new();
        let mut query = ViolationQuery::single(activity_nr, self.page_size);

        loop {
            report.calls += 1;
            let page = self.api.fetch_violations(&query).await?;
            let received = page.len() as u32;

            for raw in &page {
                match ViolationRecord::from_remote(raw) {
                    Ok(v) if v.activity_nr == activity_nr => violations.push(v),
                    Ok(v) => {
                        report.malformed += 1;
                        warn!(
                            expected = activity_nr,
                            got = %v.activity_nr,
                            "Violation for a different inspection"
                        );
                    }
                    Err(e) => {
                        report.malformed += 1;
                        warn!(activity_nr = activity_nr, error = %e, "Skipping malformed violation");
                    }
                }
            }

            if received < self.page_size {
                return Ok(violations);
            }
            query.offset += received;
        }
    }

    fn record_metrics(&self, report: &ViolationSyncReport) {
        if let Some(metrics) = &self.metrics {
            let job = JobKind::ViolationWatch.as_str();
            metrics.record_violations_found(job, report.new_violations_found as u64);
            metrics.record_records(job, "duplicate", report.duplicates as u64);
            metrics.record_records(job, "malformed", report.malformed as u64);
        }
    }
}

#[async_trait]
impl Job for ViolationWatcher {
    fn kind(&self) -> JobKind {
        JobKind::ViolationWatch
    }

    async fn execute(&self, bounds: &RunBounds, stop: &watch::Receiver<bool>) -> JobReport {
        JobReport::ViolationWatch(self.run(bounds, stop).await)
    }
}
