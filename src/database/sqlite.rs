//! SQLite implementation of the Store trait
//!
//! This module provides a SQLite-based implementation of the Store trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::{CREATE_SCHEMA, WATERMARK_CONSUMED_KEY, WATERMARK_KEY};
use super::Store;
use crate::error::DbError;
use crate::models::remote::format_timestamp;
use crate::models::{
    CandidateTier, InsertOutcome, InspectionRecord, JobKind, JobRun, RunStatus, StoredInspection,
    SyncWatermark, UpsertOutcome, ViolationCandidate, ViolationCheckOutcome, ViolationRecord,
};

/// Days after open_date at which the citation window opens
pub const CITATION_WINDOW_START_DAYS: i64 = 90;

/// Days after open_date at which the citation window closes
pub const CITATION_WINDOW_END_DAYS: i64 = 270;

/// SQLite store implementation
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a SQLite store and apply the schema
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::Migration(format!("create {:?}: {}", parent, e)))?;
                }
            }
        }

        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory store (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

/// Fields an upsert may overwrite, in storage form
#[derive(Debug, PartialEq)]
struct MutableFields {
    estab_name: Option<String>,
    site_address: Option<String>,
    site_city: Option<String>,
    site_state: Option<String>,
    site_zip: Option<String>,
    naics_code: Option<String>,
    insp_type: Option<String>,
    close_case_date: Option<String>,
    published_at: String,
}

impl From<&InspectionRecord> for MutableFields {
    fn from(r: &InspectionRecord) -> Self {
        Self {
            estab_name: r.estab_name.clone(),
            site_address: r.site_address.clone(),
            site_city: r.site_city.clone(),
            site_state: r.site_state.clone(),
            site_zip: r.site_zip.clone(),
            naics_code: r.naics_code.clone(),
            insp_type: r.insp_type.clone(),
            close_case_date: r.close_case_date.map(|d| d.to_string()),
            published_at: format_timestamp(&r.published_at),
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    // =========================================================================
    // Inspection operations
    // =========================================================================

    async fn upsert_inspection(&self, record: &InspectionRecord) -> Result<UpsertOutcome, DbError> {
        let activity_nr = record.activity_nr.clone();
        let open_date = record.open_date.to_string();
        let incoming = MutableFields::from(record);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let existing = tx
                    .query_row(
                        r#"
                        SELECT estab_name, site_address, site_city, site_state, site_zip,
                               naics_code, insp_type, close_case_date, published_at
                        FROM inspections
                        WHERE activity_nr = ?1
                        "#,
                        [&activity_nr],
                        |row| {
                            Ok(MutableFields {
                                estab_name: row.get(0)?,
                                site_address: row.get(1)?,
                                site_city: row.get(2)?,
                                site_state: row.get(3)?,
                                site_zip: row.get(4)?,
                                naics_code: row.get(5)?,
                                insp_type: row.get(6)?,
                                close_case_date: row.get(7)?,
                                published_at: row.get(8)?,
                            })
                        },
                    )
                    .optional()?;

                let outcome = match existing {
                    None => {
                        tx.execute(
                            r#"
                            INSERT INTO inspections
                            (activity_nr, estab_name, site_address, site_city, site_state,
                             site_zip, naics_code, insp_type, open_date, close_case_date,
                             published_at)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                            "#,
                            rusqlite::params![
                                activity_nr,
                                incoming.estab_name,
                                incoming.site_address,
                                incoming.site_city,
                                incoming.site_state,
                                incoming.site_zip,
                                incoming.naics_code,
                                incoming.insp_type,
                                open_date,
                                incoming.close_case_date,
                                incoming.published_at,
                            ],
                        )?;
                        UpsertOutcome::Inserted
                    }
                    Some(current) if current == incoming => UpsertOutcome::Unchanged,
                    Some(_) => {
                        // open_date is deliberately absent from the SET list
                        tx.execute(
                            r#"
                            UPDATE inspections SET
                                estab_name = ?2, site_address = ?3, site_city = ?4,
                                site_state = ?5, site_zip = ?6, naics_code = ?7,
                                insp_type = ?8, close_case_date = ?9, published_at = ?10,
                                updated_at = CURRENT_TIMESTAMP
                            WHERE activity_nr = ?1
                            "#,
                            rusqlite::params![
                                activity_nr,
                                incoming.estab_name,
                                incoming.site_address,
                                incoming.site_city,
                                incoming.site_state,
                                incoming.site_zip,
                                incoming.naics_code,
                                incoming.insp_type,
                                incoming.close_case_date,
                                incoming.published_at,
                            ],
                        )?;
                        UpsertOutcome::Updated
                    }
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(Into::into)
    }

    async fn get_inspection(
        &self,
        activity_nr: &str,
    ) -> Result<Option<StoredInspection>, DbError> {
        let activity_nr = activity_nr.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT activity_nr, estab_name, site_address, site_city, site_state,
                           site_zip, naics_code, insp_type, open_date, close_case_date,
                           published_at, total_current_penalty, total_initial_penalty,
                           last_violation_check, violation_check_count,
                           new_violations_detected, new_violations_count, new_violations_at
                    FROM inspections
                    WHERE activity_nr = ?1
                    "#,
                )?;

                let result = stmt
                    .query_row([&activity_nr], |row| {
                        Ok(StoredInspection {
                            record: InspectionRecord {
                                activity_nr: row.get(0)?,
                                estab_name: row.get(1)?,
                                site_address: row.get(2)?,
                                site_city: row.get(3)?,
                                site_state: row.get(4)?,
                                site_zip: row.get(5)?,
                                naics_code: row.get(6)?,
                                insp_type: row.get(7)?,
                                open_date: date_column(8, row.get(8)?)?,
                                close_case_date: row
                                    .get::<_, Option<String>>(9)?
                                    .map(|d| date_column(9, d))
                                    .transpose()?,
                                published_at: timestamp_column(10, row.get(10)?)?,
                            },
                            total_current_penalty: row.get(11)?,
                            total_initial_penalty: row.get(12)?,
                            last_violation_check: parse_datetime(row.get(13)?),
                            violation_check_count: row.get::<_, i64>(14)? as u32,
                            new_violations_detected: row.get::<_, i64>(15)? != 0,
                            new_violations_count: row.get::<_, i64>(16)? as u32,
                            new_violations_at: parse_datetime(row.get(17)?),
                        })
                    })
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_inspections(&self) -> Result<u64, DbError> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM inspections", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Violation operations
    // =========================================================================

    async fn insert_violation(
        &self,
        violation: &ViolationRecord,
    ) -> Result<InsertOutcome, DbError> {
        let violation = violation.clone();

        self.conn
            .call(move |conn| Ok(insert_violation_row(conn, &violation)?))
            .await
            .map_err(Into::into)
    }

    async fn list_violations(&self, activity_nr: &str) -> Result<Vec<ViolationRecord>, DbError> {
        let activity_nr = activity_nr.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT activity_nr, citation_id, issuance_date, viol_type, standard,
                           gravity, current_penalty, initial_penalty, nr_exposed
                    FROM violations
                    WHERE activity_nr = ?1
                    ORDER BY citation_id
                    "#,
                )?;

                let violations = stmt
                    .query_map([&activity_nr], |row| {
                        Ok(ViolationRecord {
                            activity_nr: row.get(0)?,
                            citation_id: row.get(1)?,
                            issuance_date: row
                                .get::<_, Option<String>>(2)?
                                .map(|d| date_column(2, d))
                                .transpose()?,
                            viol_type: row.get(3)?,
                            standard: row.get(4)?,
                            gravity: row.get(5)?,
                            current_penalty: row.get(6)?,
                            initial_penalty: row.get(7)?,
                            nr_exposed: row.get(8)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(violations)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_violations(&self) -> Result<u64, DbError> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    async fn refresh_penalty_totals(&self, activity_nr: &str) -> Result<(), DbError> {
        let activity_nr = activity_nr.to_string();

        let updated = self
            .conn
            .call(move |conn| Ok(refresh_totals(conn, &activity_nr)?))
            .await?;

        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // =========================================================================
    // Violation watcher operations
    // =========================================================================

    async fn select_violation_candidates(
        &self,
        today: NaiveDate,
        limit: u32,
    ) -> Result<Vec<ViolationCandidate>, DbError> {
        let window_start = (today - Duration::days(CITATION_WINDOW_END_DAYS)).to_string();
        let window_end = (today - Duration::days(CITATION_WINDOW_START_DAYS)).to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT activity_nr, open_date, last_violation_check, tier
                    FROM (
                        SELECT i.activity_nr, i.open_date, i.last_violation_check,
                            CASE
                                WHEN NOT EXISTS (
                                        SELECT 1 FROM violations v
                                        WHERE v.activity_nr = i.activity_nr)
                                     AND i.open_date BETWEEN ?1 AND ?2 THEN 1
                                WHEN EXISTS (
                                        SELECT 1 FROM violations v
                                        WHERE v.activity_nr = i.activity_nr)
                                     AND i.close_case_date IS NULL THEN 2
                                ELSE 3
                            END AS tier
                        FROM inspections i
                    )
                    ORDER BY tier ASC,
                             last_violation_check IS NOT NULL,
                             last_violation_check ASC,
                             open_date DESC,
                             activity_nr ASC
                    LIMIT ?3
                    "#,
                )?;

                let candidates = stmt
                    .query_map(
                        rusqlite::params![window_start, window_end, limit as i64],
                        |row| {
                            Ok(ViolationCandidate {
                                activity_nr: row.get(0)?,
                                open_date: date_column(1, row.get(1)?)?,
                                last_violation_check: parse_datetime(row.get(2)?),
                                tier: CandidateTier::from_rank(row.get(3)?),
                            })
                        },
                    )?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(candidates)
            })
            .await
            .map_err(Into::into)
    }

    async fn record_violation_check(
        &self,
        activity_nr: &str,
        violations: &[ViolationRecord],
        checked_at: DateTime<Utc>,
    ) -> Result<ViolationCheckOutcome, DbError> {
        let activity_nr = activity_nr.to_string();
        let violations = violations.to_vec();
        let checked_at = format_timestamp(&checked_at);

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists = tx
                    .query_row(
                        "SELECT 1 FROM inspections WHERE activity_nr = ?1",
                        [&activity_nr],
                        |_| Ok(()),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Ok(None);
                }

                let mut outcome = ViolationCheckOutcome::default();
                for violation in &violations {
                    match insert_violation_row(&tx, violation)? {
                        InsertOutcome::Inserted => outcome.inserted += 1,
                        InsertOutcome::Duplicate => outcome.duplicates += 1,
                    }
                }

                tx.execute(
                    r#"
                    UPDATE inspections SET
                        violation_check_count = violation_check_count + 1,
                        last_violation_check = ?2,
                        new_violations_detected =
                            CASE WHEN ?3 > 0 THEN 1 ELSE new_violations_detected END,
                        new_violations_count = new_violations_count + ?3,
                        new_violations_at =
                            CASE WHEN ?3 > 0 THEN ?2 ELSE new_violations_at END,
                        updated_at = CURRENT_TIMESTAMP
                    WHERE activity_nr = ?1
                    "#,
                    rusqlite::params![activity_nr, checked_at, outcome.inserted as i64],
                )?;

                refresh_totals(&tx, &activity_nr)?;

                tx.commit()?;
                Ok(Some(outcome))
            })
            .await?;

        outcome.ok_or(DbError::NotFound)
    }

    // =========================================================================
    // Watermark operations
    // =========================================================================

    async fn get_watermark(&self) -> Result<Option<SyncWatermark>, DbError> {
        self.conn
            .call(|conn| Ok(read_watermark(conn)?))
            .await
            .map_err(Into::into)
    }

    async fn advance_watermark(&self, candidate: SyncWatermark) -> Result<SyncWatermark, DbError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let effective = match read_watermark(&tx)? {
                    Some(current) if current >= candidate => current,
                    _ => {
                        let upsert = r#"
                            INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                            ON CONFLICT(key) DO UPDATE SET
                                value = excluded.value,
                                updated_at = CURRENT_TIMESTAMP
                        "#;
                        tx.execute(
                            upsert,
                            rusqlite::params![
                                WATERMARK_KEY,
                                format_timestamp(&candidate.published_at)
                            ],
                        )?;
                        tx.execute(
                            upsert,
                            rusqlite::params![
                                WATERMARK_CONSUMED_KEY,
                                candidate.consumed.to_string()
                            ],
                        )?;
                        candidate
                    }
                };

                tx.commit()?;
                Ok(effective)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Job run operations
    // =========================================================================

    async fn record_job_run(&self, run: &JobRun) -> Result<i64, DbError> {
        let job = run.job.as_str();
        let status = run.status.to_string();
        let trigger = run.trigger.clone();
        let started_at = format_timestamp(&run.started_at);
        let finished_at = format_timestamp(&run.finished_at);
        let details = run.details.clone();
        let error = run.error.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO job_runs
                    (job_name, status, fired_by, started_at, finished_at, details, error)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![job, status, trigger, started_at, finished_at, details, error],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    async fn last_job_run(&self, job: JobKind) -> Result<Option<JobRun>, DbError> {
        self.conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        r#"
                        SELECT id, status, fired_by, started_at, finished_at, details, error
                        FROM job_runs
                        WHERE job_name = ?1
                        ORDER BY started_at DESC, id DESC
                        LIMIT 1
                        "#,
                        [job.as_str()],
                        |row| {
                            Ok(JobRun {
                                id: Some(row.get(0)?),
                                job,
                                status: parse_run_status(row.get(1)?),
                                trigger: row.get(2)?,
                                started_at: timestamp_column(3, row.get(3)?)?,
                                finished_at: timestamp_column(4, row.get(4)?)?,
                                details: row.get(5)?,
                                error: row.get(6)?,
                            })
                        },
                    )
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }
}

/// Insert one violation, ignoring an existing (activity_nr, citation_id)
fn insert_violation_row(
    conn: &rusqlite::Connection,
    v: &ViolationRecord,
) -> rusqlite::Result<InsertOutcome> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO violations
        (activity_nr, citation_id, issuance_date, viol_type, standard, gravity,
         current_penalty, initial_penalty, nr_exposed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        rusqlite::params![
            v.activity_nr,
            v.citation_id,
            v.issuance_date.map(|d| d.to_string()),
            v.viol_type,
            v.standard,
            v.gravity,
            v.current_penalty,
            v.initial_penalty,
            v.nr_exposed,
        ],
    )?;

    Ok(if inserted == 0 {
        InsertOutcome::Duplicate
    } else {
        InsertOutcome::Inserted
    })
}

/// Recompute penalty totals; returns the number of inspections updated
fn refresh_totals(conn: &rusqlite::Connection, activity_nr: &str) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        UPDATE inspections SET
            total_current_penalty = (
                SELECT COALESCE(SUM(current_penalty), 0) FROM violations
                WHERE activity_nr = ?1),
            total_initial_penalty = (
                SELECT COALESCE(SUM(initial_penalty), 0) FROM violations
                WHERE activity_nr = ?1)
        WHERE activity_nr = ?1
        "#,
        [activity_nr],
    )
}

/// Parse a datetime string to DateTime<Utc>
/// Read the watermark; a missing consumed count reads as zero
fn read_watermark(conn: &rusqlite::Connection) -> rusqlite::Result<Option<SyncWatermark>> {
    let value = |key: &str| -> rusqlite::Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
    };

    let Some(published_at) = parse_datetime(value(WATERMARK_KEY)?) else {
        return Ok(None);
    };
    let consumed = value(WATERMARK_CONSUMED_KEY)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(Some(SyncWatermark::new(published_at, consumed)))
}

fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

fn date_column(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_datetime(Some(raw.clone())).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

/// Parse run status string to RunStatus
fn parse_run_status(s: String) -> RunStatus {
    s.parse().unwrap_or(RunStatus::Failed)
}
