//! Incremental inspection sync
//!
//! A run fixes `since = watermark` at start and pages through everything
//! published at or after its timestamp, oldest first, skipping the records
//! already consumed at that timestamp. Each fully processed page advances the
//! watermark to the position of its last record, so an interrupted run
//! resumes where it stopped even inside a batch sharing one timestamp.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::admission::{Admission, AdmissionFilter};
use super::http_client::{InspectionQuery, OshaApi, ViolationQuery, MAX_BATCH_ACTIVITY_NRS};
use super::scheduler::Job;
use super::{JobReport, RunBounds, StopReason};
use crate::config::IngestConfig;
use crate::database::Store;
use crate::error::DbError;
use crate::models::{
    InsertOutcome, InspectionRecord, JobKind, SyncWatermark, UpsertOutcome, ViolationRecord,
};
use crate::otel::Metrics;

/// Outcome of one inspection sync run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionSyncReport {
    /// Raw records received, malformed ones included
    pub fetched: u32,
    /// Records that passed admission
    pub accepted: u32,
    /// Records refused by admission
    pub rejected: u32,
    /// Records that could not be parsed
    pub malformed: u32,
    /// New inspections
    pub inserted: u32,
    /// Existing inspections whose mutable fields changed
    pub updated: u32,
    /// Existing inspections already up to date
    pub unchanged: u32,
    /// Accepted records written through upsert (inserted + updated + unchanged)
    pub upserted: u32,
    /// Remote calls made, violation batches included
    pub calls: u32,
    /// Violations stored for newly inserted inspections
    pub violations_inserted: u32,
    /// Violation rows that could not be parsed or named another inspection
    pub violations_malformed: u32,
    /// Watermark at run start
    pub watermark_before: Option<SyncWatermark>,
    /// Watermark at run end
    pub watermark_after: Option<SyncWatermark>,
    pub stop_reason: StopReason,
}

/// Fetches new and updated inspections since the watermark
pub struct InspectionSyncer {
    store: Arc<dyn Store>,
    api: Arc<dyn OshaApi>,
    filter: AdmissionFilter,
    page_size: u32,
    max_records: u32,
    max_calls: u32,
    fetch_new_violations: bool,
    metrics: Option<Arc<Metrics>>,
}

impl InspectionSyncer {
    /// Create a syncer using the per-run defaults from `config`
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn OshaApi>,
        filter: AdmissionFilter,
        config: &IngestConfig,
    ) -> Self {
        Self {
            store,
            api,
            filter,
            page_size: config.page_size.max(1),
            max_records: config.max_records_per_run,
            max_calls: config.max_calls_per_run,
            fetch_new_violations: config.fetch_new_violations,
            metrics: None,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one sync
    ///
    /// Never fails: client and store failures end the run early and are
    /// reported through `stop_reason`, with everything done so far kept.
    pub async fn run(&self, bounds: &RunBounds, stop: &watch::Receiver<bool>) -> InspectionSyncReport {
        let max_records = bounds.max_records.unwrap_or(self.max_records);
        let max_calls = bounds.max_calls.unwrap_or(self.max_calls);
        let mut report = InspectionSyncReport::default();

        let since = match self.store.get_watermark().await {
            Ok(watermark) => watermark,
            Err(e) => {
                report.stop_reason = StopReason::StoreError(e.to_string());
                return report;
            }
        };
        report.watermark_before = since;
        report.watermark_after = since;

        info!(
            since = ?since,
            max_records = max_records,
            max_calls = max_calls,
            "Starting inspection sync"
        );

        let mut inserted_nrs = Vec::new();
        let mut offset = since.map_or(0, |w| w.consumed);
        let mut position = since;

        let mut stop_reason = loop {
            if *stop.borrow() {
                break StopReason::Cancelled;
            }
            if report.calls >= max_calls {
                break StopReason::CallCap;
            }
            if report.fetched >= max_records {
                break StopReason::RecordCap;
            }

            let limit = self.page_size.min(max_records - report.fetched);
            let query = InspectionQuery {
                published_since: since.map(|w| w.published_at),
                offset,
                limit,
            };

            report.calls += 1;
            let mut page = match self.api.fetch_inspections(&query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset = offset, error = %e, "Inspection page failed");
                    break StopReason::from_client(&e);
                }
            };
            page.truncate(limit as usize);
            let received = page.len() as u32;

            if let Err(e) = self
                .ingest_page(&page, &mut report, &mut inserted_nrs, &mut position)
                .await
            {
                break StopReason::StoreError(e.to_string());
            }

            if let Some(candidate) = position.filter(|p| Some(*p) > report.watermark_after) {
                match self.store.advance_watermark(candidate).await {
                    Ok(watermark) => report.watermark_after = Some(watermark),
                    Err(e) => break StopReason::StoreError(e.to_string()),
                }
            }

            debug!(
                offset = offset,
                received = received,
                watermark = ?report.watermark_after,
                "Inspection page processed"
            );

            offset += received;
            if received < limit {
                break StopReason::Completed;
            }
        };

        if self.fetch_new_violations
            && !inserted_nrs.is_empty()
            && matches!(stop_reason, StopReason::Completed | StopReason::RecordCap)
        {
            if let Some(reason) = self
                .fetch_violations_for(&inserted_nrs, max_calls, &mut report)
                .await
            {
                stop_reason = reason;
            }
        }

        report.stop_reason = stop_reason;
        self.record_metrics(&report);

        info!(
            fetched = report.fetched,
            accepted = report.accepted,
            rejected = report.rejected,
            malformed = report.malformed,
            inserted = report.inserted,
            updated = report.updated,
            calls = report.calls,
            violations_inserted = report.violations_inserted,
            violations_malformed = report.violations_malformed,
            watermark = ?report.watermark_after,
            stop_reason = ?report.stop_reason,
            "Inspection sync finished"
        );

        report
    }

    /// Parse, admit and upsert one page, moving `position` past every record
    async fn ingest_page(
        &self,
        page: &[Value],
        report: &mut InspectionSyncReport,
        inserted_nrs: &mut Vec<String>,
        position: &mut Option<SyncWatermark>,
    ) -> Result<(), DbError> {
        for raw in page {
            report.fetched += 1;

            let record = match InspectionRecord::from_remote(raw) {
                Ok(record) => record,
                Err(e) => {
                    report.malformed += 1;
                    *position = SyncWatermark::observe(*position, None);
                    warn!(error = %e, "Skipping malformed inspection record");
                    continue;
                }
            };

            // Rejected records still move the watermark past them
            *position = SyncWatermark::observe(*position, Some(record.published_at));

            if let Admission::Reject(reason) = self.filter.decide(&record) {
                report.rejected += 1;
                debug!(activity_nr = %record.activity_nr, reason = %reason, "Inspection rejected");
                continue;
            }
            report.accepted += 1;

            match self.store.upsert_inspection(&record).await? {
                UpsertOutcome::Inserted => {
                    report.inserted += 1;
                    inserted_nrs.push(record.activity_nr);
                }
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
            }
            report.upserted += 1;
        }

        Ok(())
    }

    /// Batch-fetch violations for inspections inserted by this run
    ///
    /// Returns a stop reason when the phase could not finish.
    async fn fetch_violations_for(
        &self,
        activity_nrs: &[String],
        max_calls: u32,
        report: &mut InspectionSyncReport,
    ) -> Option<StopReason> {
        let mut touched = BTreeSet::new();
        let mut outcome = None;

        'batches: for batch in activity_nrs.chunks(MAX_BATCH_ACTIVITY_NRS) {
            let wanted: BTreeSet<&str> = batch.iter().map(String::as_str).collect();
            let mut offset = 0u32;

            loop {
                if report.calls >= max_calls {
                    outcome = Some(StopReason::CallCap);
                    break 'batches;
                }

                let query = ViolationQuery {
                    activity_nrs: batch.to_vec(),
                    offset,
                    limit: self.page_size,
                };
                report.calls += 1;
                let page = match self.api.fetch_violations(&query).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(batch = batch.len(), error = %e, "Violation batch failed");
                        outcome = Some(StopReason::from_client(&e));
                        break 'batches;
                    }
                };
                let received = page.len() as u32;

                for raw in &page {
                    let violation = match ViolationRecord::from_remote(raw) {
                        Ok(v) if wanted.contains(v.activity_nr.as_str()) => v,
                        Ok(v) => {
                            report.violations_malformed += 1;
                            warn!(activity_nr = %v.activity_nr, "Violation for unrequested inspection");
                            continue;
                        }
                        Err(e) => {
                            report.violations_malformed += 1;
                            warn!(error = %e, "Skipping malformed violation record");
                            continue;
                        }
                    };

                    match self.store.insert_violation(&violation).await {
                        Ok(InsertOutcome::Inserted) => {
                            report.violations_inserted += 1;
                            touched.insert(violation.activity_nr);
                        }
                        Ok(InsertOutcome::Duplicate) => {}
                        Err(e) => {
                            outcome = Some(StopReason::StoreError(e.to_string()));
                            break 'batches;
                        }
                    }
                }

                offset += received;
                if received < self.page_size {
                    break;
                }
            }
        }

        for activity_nr in &touched {
            if let Err(e) = self.store.refresh_penalty_totals(activity_nr).await {
                return Some(StopReason::StoreError(e.to_string()));
            }
        }

        outcome
    }

    fn record_metrics(&self, report: &InspectionSyncReport) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let job = JobKind::InspectionSync.as_str();
        metrics.record_records(job, "inserted", report.inserted as u64);
        metrics.record_records(job, "updated", report.updated as u64);
        metrics.record_records(job, "unchanged", report.unchanged as u64);
        metrics.record_records(job, "rejected", report.rejected as u64);
        metrics.record_records(job, "malformed", report.malformed as u64);
        metrics.record_records(job, "violations_malformed", report.violations_malformed as u64);
        metrics.record_violations_found(job, report.violations_inserted as u64);
    }
}

#[async_trait]
impl Job for InspectionSyncer {
    fn kind(&self) -> JobKind {
        JobKind::InspectionSync
    }

    async fn execute(&self, bounds: &RunBounds, stop: &watch::Receiver<bool>) -> JobReport {
        JobReport::InspectionSync(self.run(bounds, stop).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MockStore, SqliteStore};
    use crate::error::SyncError;
    use crate::sync::http_client::MockOshaApi;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves a fixed corpus by offset, honoring the watermark filter
    struct PagedApi {
        inspections: Vec<Value>,
        violations: Vec<Value>,
        fail_on_call: Option<(u32, SyncError)>,
        calls: Mutex<u32>,
    }

    impl PagedApi {
        fn new(inspections: Vec<Value>) -> Self {
            Self {
                inspections,
                violations: Vec::new(),
                fail_on_call: None,
                calls: Mutex::new(0),
            }
        }

        fn with_violations(mut self, violations: Vec<Value>) -> Self {
            self.violations = violations;
            self
        }

        fn failing_on(mut self, call: u32, err: SyncError) -> Self {
            self.fail_on_call = Some((call, err));
            self
        }

        fn next_call(&self) -> Result<(), SyncError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            match &self.fail_on_call {
                Some((n, err)) if *n == *calls => Err(err.clone()),
                _ => Ok(()),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl OshaApi for PagedApi {
        async fn fetch_inspections(&self, q: &InspectionQuery) -> Result<Vec<Value>, SyncError> {
            self.next_call()?;
            let visible: Vec<Value> = self
                .inspections
                .iter()
                .filter(|raw| {
                    let published = crate::models::remote::parse_timestamp(
                        raw["load_dt"].as_str().unwrap_or_default(),
                    );
                    match (q.published_since, published) {
                        (Some(since), Some(p)) => p >= since,
                        _ => true,
                    }
                })
                .cloned()
                .collect();
            Ok(visible
                .into_iter()
                .skip(q.offset as usize)
                .take(q.limit as usize)
                .collect())
        }

        async fn fetch_violations(&self, q: &ViolationQuery) -> Result<Vec<Value>, SyncError> {
            self.next_call()?;
            Ok(self
                .violations
                .iter()
                .filter(|raw| {
                    q.activity_nrs
                        .iter()
                        .any(|nr| raw["activity_nr"].as_str() == Some(nr.as_str()))
                })
                .skip(q.offset as usize)
                .take(q.limit as usize)
                .cloned()
                .collect())
        }
    }

    fn inspection(nr: u32, open_date: &str, minute: u32) -> Value {
        json!({
            "activity_nr": nr.to_string(),
            "estab_name": format!("ESTAB {}", nr),
            "site_state": "GA",
            "open_date": open_date,
            "load_dt": format!("2025-01-01 00:{:02}:00", minute),
        })
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
    }

    fn config(page_size: u32) -> IngestConfig {
        IngestConfig {
            page_size,
            fetch_new_violations: false,
            ..IngestConfig::default()
        }
    }

    fn stop_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    async fn syncer(api: Arc<PagedApi>, config: &IngestConfig) -> (InspectionSyncer, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let syncer = InspectionSyncer::new(
            store.clone(),
            api,
            AdmissionFilter::from_config(config),
            config,
        );
        (syncer, store)
    }

    // Test 1: Pages until a short page and advances the watermark
    #[tokio::test]
    async fn test_sync_pages_until_short_page() {
        let records = (0..5).map(|i| inspection(100 + i, "2024-03-01", i)).collect();
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api.clone(), &config(2)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(report.upserted, 5);
        assert_eq!(report.calls, 3);
        assert_eq!(api.calls(), 3);
        assert_eq!(store.count_inspections().await.unwrap(), 5);
        assert_eq!(report.watermark_after, Some(SyncWatermark::new(at(4), 1)));
        assert_eq!(store.get_watermark().await.unwrap(), report.watermark_after);
    }

    // Test 2: Records before the cutoff are rejected but move the watermark
    #[tokio::test]
    async fn test_cutoff_rejections() {
        let records = vec![
            inspection(1, "2019-12-31", 1),
            inspection(2, "2020-01-01", 2),
            inspection(3, "2015-06-01", 3),
        ];
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 2);
        assert!(store.get_inspection("1").await.unwrap().is_none());
        assert!(store.get_inspection("2").await.unwrap().is_some());
        assert_eq!(report.watermark_after, Some(SyncWatermark::new(at(3), 1)));
    }

    // Test 3: Malformed records are counted and skipped
    #[tokio::test]
    async fn test_malformed_records_skipped() {
        let records = vec![
            inspection(1, "2024-01-01", 1),
            json!({"activity_nr": "2", "load_dt": "2025-01-01 00:02:00"}),
            json!("not an object"),
            inspection(4, "2024-01-01", 4),
        ];
        let api = Arc::new(PagedApi::new(records));
        let (syncer, _store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.fetched, 4);
        assert_eq!(report.malformed, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.stop_reason, StopReason::Completed);
    }

    // Test 4: Record cap stops after the first full page
    #[tokio::test]
    async fn test_record_cap() {
        let records = (0..25).map(|i| inspection(100 + i, "2024-03-01", i)).collect();
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::records(10), &rx).await;

        assert_eq!(report.stop_reason, StopReason::RecordCap);
        assert_eq!(report.upserted, 10);
        assert_eq!(store.count_inspections().await.unwrap(), 10);
        assert_eq!(
            store.get_watermark().await.unwrap(),
            Some(SyncWatermark::new(at(9), 1))
        );
    }

    // Test 5: Call cap
    #[tokio::test]
    async fn test_call_cap() {
        let records = (0..25).map(|i| inspection(100 + i, "2024-03-01", i)).collect();
        let api = Arc::new(PagedApi::new(records));
        let (syncer, _store) = syncer(api.clone(), &config(5)).await;
        let (_tx, rx) = stop_signal();

        let bounds = RunBounds {
            max_calls: Some(2),
            ..RunBounds::default()
        };
        let report = syncer.run(&bounds, &rx).await;

        assert_eq!(report.stop_reason, StopReason::CallCap);
        assert_eq!(report.calls, 2);
        assert_eq!(report.fetched, 10);
        assert_eq!(api.calls(), 2);
    }

    // Test 6: Rate limited mid-run keeps the last advanced watermark
    #[tokio::test]
    async fn test_rate_limited_keeps_watermark() {
        let records = (0..25).map(|i| inspection(100 + i, "2024-03-01", i)).collect();
        let api = Arc::new(PagedApi::new(records).failing_on(2, SyncError::RateLimited(120)));
        let (syncer, store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.stop_reason, StopReason::RateLimited);
        assert_eq!(report.inserted, 10);
        let first_page_max = SyncWatermark::new(at(9), 1);
        assert_eq!(report.watermark_after, Some(first_page_max));
        assert_eq!(store.get_watermark().await.unwrap(), Some(first_page_max));
    }

    // Test 7: Stop signal set before the run makes no calls
    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let api = Arc::new(PagedApi::new(vec![inspection(1, "2024-01-01", 1)]));
        let (syncer, _store) = syncer(api.clone(), &config(10)).await;
        let (tx, rx) = stop_signal();
        tx.send(true).unwrap();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(api.calls(), 0);
    }

    // Test 8: Second run only sees newer records and inserts nothing
    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let records = (0..3).map(|i| inspection(100 + i, "2024-03-01", i)).collect();
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let first = syncer.run(&RunBounds::default(), &rx).await;
        let second = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(first.inserted, 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.fetched, 0);
        assert_eq!(second.watermark_before, first.watermark_after);
        assert_eq!(store.count_inspections().await.unwrap(), 3);
    }

    // Test 9: Violations of newly inserted inspections are batch-fetched
    #[tokio::test]
    async fn test_fetches_violations_for_new_inspections() {
        let records = vec![inspection(1, "2024-01-01", 1), inspection(2, "2024-01-01", 2)];
        let violations = vec![
            json!({"activity_nr": "1", "citation_id": "01001", "current_penalty": "1,000"}),
            json!({"activity_nr": "1", "citation_id": "01002", "current_penalty": 500}),
            json!({"activity_nr": "9", "citation_id": "01001"}),
        ];
        let api = Arc::new(PagedApi::new(records).with_violations(violations));
        let config = IngestConfig {
            page_size: 10,
            fetch_new_violations: true,
            ..IngestConfig::default()
        };
        let (syncer, store) = syncer(api.clone(), &config).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;

        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.violations_inserted, 2);
        assert_eq!(report.violations_malformed, 1);
        assert_eq!(report.calls, 2);
        let stored = store.get_inspection("1").await.unwrap().unwrap();
        assert_eq!(stored.total_current_penalty, 1500.0);
        assert_eq!(stored.violation_check_count, 0);
    }

    // Test 10: Store failure on the watermark read ends the run immediately
    #[tokio::test]
    async fn test_store_failure_on_watermark() {
        let mut store = MockStore::new();
        store
            .expect_get_watermark()
            .returning(|| Err(DbError::Connection("closed".to_string())));
        let mut api = MockOshaApi::new();
        api.expect_fetch_inspections().never();

        let syncer = InspectionSyncer::new(
            Arc::new(store),
            Arc::new(api),
            AdmissionFilter::new(2020),
            &IngestConfig::default(),
        );
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::default(), &rx).await;
        assert!(matches!(report.stop_reason, StopReason::StoreError(_)));
        assert_eq!(report.calls, 0);
    }

    // Test 11: Job wrapper reports the inspection kind
    #[tokio::test]
    async fn test_job_execute() {
        let api = Arc::new(PagedApi::new(Vec::new()));
        let (syncer, _store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        assert_eq!(syncer.kind(), JobKind::InspectionSync);
        let report = syncer.execute(&RunBounds::default(), &rx).await;
        assert_eq!(report.kind(), JobKind::InspectionSync);
        assert_eq!(report.calls(), 1);
    }

    // Test 12: A batch sharing one timestamp is drained across capped runs
    #[tokio::test]
    async fn test_tied_timestamps_span_capped_runs() {
        let records = (0..25).map(|i| inspection(100 + i, "2024-03-01", 0)).collect();
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api, &config(10)).await;
        let (_tx, rx) = stop_signal();

        let mut stored = 0;
        for expected in [10u32, 20, 25] {
            let report = syncer.run(&RunBounds::records(10), &rx).await;
            assert_eq!(report.inserted, expected - stored);
            stored = expected;
            assert_eq!(store.count_inspections().await.unwrap(), u64::from(expected));
            assert_eq!(
                store.get_watermark().await.unwrap(),
                Some(SyncWatermark::new(at(0), expected))
            );
        }

        let last = syncer.run(&RunBounds::records(10), &rx).await;
        assert_eq!(last.fetched, 0);
        assert_eq!(last.stop_reason, StopReason::Completed);
        assert_eq!(store.count_inspections().await.unwrap(), 25);
    }

    // Test 13: A tie group split by a rate limit resumes inside the group
    #[tokio::test]
    async fn test_tied_timestamps_resume_after_rate_limit() {
        let mut records: Vec<Value> =
            (0..4).map(|i| inspection(100 + i, "2024-03-01", 1)).collect();
        records.extend((4..8).map(|i| inspection(100 + i, "2024-03-01", 2)));
        let api = Arc::new(PagedApi::new(records).failing_on(2, SyncError::RateLimited(60)));
        let (syncer, store) = syncer(api, &config(3)).await;
        let (_tx, rx) = stop_signal();

        let first = syncer.run(&RunBounds::default(), &rx).await;
        assert_eq!(first.stop_reason, StopReason::RateLimited);
        assert_eq!(first.watermark_after, Some(SyncWatermark::new(at(1), 3)));

        let second = syncer.run(&RunBounds::default(), &rx).await;
        assert_eq!(second.stop_reason, StopReason::Completed);
        assert_eq!(second.fetched, 5);
        assert_eq!(second.inserted, 5);
        assert_eq!(second.unchanged, 0);
        assert_eq!(second.watermark_after, Some(SyncWatermark::new(at(2), 4)));
        assert_eq!(store.count_inspections().await.unwrap(), 8);
    }

    // Test 14: Malformed records use up the record budget
    #[tokio::test]
    async fn test_malformed_records_count_toward_record_cap() {
        let records = vec![
            json!({"activity_nr": "1", "load_dt": "2025-01-01 00:01:00"}),
            inspection(2, "2024-01-01", 2),
            inspection(3, "2024-01-01", 3),
            inspection(4, "2024-01-01", 4),
        ];
        let api = Arc::new(PagedApi::new(records));
        let (syncer, store) = syncer(api.clone(), &config(10)).await;
        let (_tx, rx) = stop_signal();

        let report = syncer.run(&RunBounds::records(3), &rx).await;

        assert_eq!(report.stop_reason, StopReason::RecordCap);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.inserted, 2);
        assert_eq!(api.calls(), 1);
        assert!(store.get_inspection("4").await.unwrap().is_none());
    }
}
