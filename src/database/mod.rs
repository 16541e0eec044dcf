//! Storage layer for osha-ingest
//!
//! This module defines the store trait the ingestion engine reads and writes
//! through, and its SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DbError;
use crate::models::{
    InsertOutcome, InspectionRecord, JobKind, JobRun, StoredInspection, SyncWatermark,
    UpsertOutcome, ViolationCandidate, ViolationCheckOutcome, ViolationRecord,
};

/// Store trait for data persistence
///
/// Uniqueness is enforced by the store: inspections by activity number,
/// violations by (activity number, citation id). Re-applying any write is
/// idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Inspection operations
    // =========================================================================

    /// Insert a new inspection or update the mutable fields of an existing one
    ///
    /// `open_date` is never changed on update.
    async fn upsert_inspection(&self, record: &InspectionRecord) -> Result<UpsertOutcome, DbError>;

    /// Get a stored inspection by activity number
    async fn get_inspection(&self, activity_nr: &str)
        -> Result<Option<StoredInspection>, DbError>;

    /// Number of stored inspections
    async fn count_inspections(&self) -> Result<u64, DbError>;

    // =========================================================================
    // Violation operations
    // =========================================================================

    /// Insert a violation; an existing key is reported as a duplicate
    async fn insert_violation(&self, violation: &ViolationRecord)
        -> Result<InsertOutcome, DbError>;

    /// List stored violations of one inspection, by citation id
    async fn list_violations(&self, activity_nr: &str) -> Result<Vec<ViolationRecord>, DbError>;

    /// Number of stored violations
    async fn count_violations(&self) -> Result<u64, DbError>;

    /// Recompute the penalty totals of one inspection from its violations
    async fn refresh_penalty_totals(&self, activity_nr: &str) -> Result<(), DbError>;

    // =========================================================================
    // Violation watcher operations
    // =========================================================================

    /// Select up to `limit` recheck candidates in priority order
    ///
    /// Tier 1: open_date within [today - 270d, today - 90d] and no violations.
    /// Tier 2: at least one violation and no close_case_date.
    /// Tier 3: everything else.
    /// Within a tier: never checked first, then oldest check, then newest
    /// open_date, then activity number.
    async fn select_violation_candidates(
        &self,
        today: NaiveDate,
        limit: u32,
    ) -> Result<Vec<ViolationCandidate>, DbError>;

    /// Apply one completed check atomically
    ///
    /// Inserts unseen violations, bumps `violation_check_count`, sets
    /// `last_violation_check`, flags new violations and recomputes totals.
    async fn record_violation_check(
        &self,
        activity_nr: &str,
        violations: &[ViolationRecord],
        checked_at: DateTime<Utc>,
    ) -> Result<ViolationCheckOutcome, DbError>;

    // =========================================================================
    // Watermark operations
    // =========================================================================

    /// Current inspection watermark
    async fn get_watermark(&self) -> Result<Option<SyncWatermark>, DbError>;

    /// Advance the watermark if `candidate` is newer; returns the stored value
    async fn advance_watermark(&self, candidate: SyncWatermark)
        -> Result<SyncWatermark, DbError>;

    // =========================================================================
    // Job run operations
    // =========================================================================

    /// Persist a finished job run, returning its ID
    async fn record_job_run(&self, run: &JobRun) -> Result<i64, DbError>;

    /// Most recent run of a job
    async fn last_job_run(&self, job: JobKind) -> Result<Option<JobRun>, DbError>;
}
