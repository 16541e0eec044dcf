//! Inspection domain models
//!
//! This module defines the inspection record as fetched from the remote API,
//! the stored form carrying watcher bookkeeping, and violation-watch candidates.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::remote;
use crate::error::RecordError;

/// An inspection as published by the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    /// Remote activity number, unique per inspection
    pub activity_nr: String,

    /// Establishment name
    pub estab_name: Option<String>,

    /// Site street address
    pub site_address: Option<String>,

    /// Site city
    pub site_city: Option<String>,

    /// Two-letter site state code
    pub site_state: Option<String>,

    /// Site ZIP code
    pub site_zip: Option<String>,

    /// NAICS industry code
    pub naics_code: Option<String>,

    /// Inspection type code
    pub insp_type: Option<String>,

    /// Date the inspection was opened; immutable once stored
    pub open_date: NaiveDate,

    /// Date the case was closed, if it has been
    pub close_case_date: Option<NaiveDate>,

    /// When the remote system made this record visible (`load_dt`)
    pub published_at: DateTime<Utc>,
}

impl InspectionRecord {
    /// Create a record with the required fields only
    pub fn new(
        activity_nr: impl Into<String>,
        open_date: NaiveDate,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            activity_nr: activity_nr.into(),
            estab_name: None,
            site_address: None,
            site_city: None,
            site_state: None,
            site_zip: None,
            naics_code: None,
            insp_type: None,
            open_date,
            close_case_date: None,
            published_at,
        }
    }

    /// Set the establishment name
    pub fn with_estab_name(mut self, name: impl Into<String>) -> Self {
        self.estab_name = Some(name.into());
        self
    }

    /// Set the site state
    pub fn with_site_state(mut self, state: impl Into<String>) -> Self {
        self.site_state = Some(state.into());
        self
    }

    /// Set the case close date
    pub fn with_close_case_date(mut self, date: NaiveDate) -> Self {
        self.close_case_date = Some(date);
        self
    }

    /// Parse a raw API record
    pub fn from_remote(raw: &Value) -> Result<Self, RecordError> {
        let obj = remote::as_object(raw)?;

        Ok(Self {
            activity_nr: remote::req_str(obj, "activity_nr")?,
            estab_name: remote::opt_str(obj, "estab_name"),
            site_address: remote::opt_str(obj, "site_address"),
            site_city: remote::opt_str(obj, "site_city"),
            site_state: remote::opt_str(obj, "site_state").map(|s| s.to_uppercase()),
            site_zip: remote::opt_str(obj, "site_zip"),
            naics_code: remote::opt_str(obj, "naics_code"),
            insp_type: remote::opt_str(obj, "insp_type"),
            open_date: remote::req_date(obj, "open_date")?,
            close_case_date: remote::opt_date(obj, "close_case_date")?,
            published_at: remote::req_timestamp(obj, &["load_dt", "ld_dt"])?,
        })
    }

    /// Year of `open_date`
    pub fn open_year(&self) -> i32 {
        self.open_date.year()
    }
}

/// Result of upserting an inspection by activity number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// New row
    Inserted,
    /// Mutable fields changed
    Updated,
    /// Row already matched the record
    Unchanged,
}

/// A stored inspection with watcher bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInspection {
    /// Fields as last ingested
    #[serde(flatten)]
    pub record: InspectionRecord,

    /// Sum of `current_penalty` over stored violations
    pub total_current_penalty: f64,

    /// Sum of `initial_penalty` over stored violations
    pub total_initial_penalty: f64,

    /// Last time the violation watcher checked this inspection
    pub last_violation_check: Option<DateTime<Utc>>,

    /// Number of completed violation checks
    pub violation_check_count: u32,

    /// Set once a recheck discovered violations that were not stored before
    pub new_violations_detected: bool,

    /// Violations discovered by rechecks
    pub new_violations_count: u32,

    /// When the most recent new violations were discovered
    pub new_violations_at: Option<DateTime<Utc>>,
}

/// Priority tier of a violation-watch candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateTier {
    /// Inside the citation window with no violations yet
    CitationWindow = 1,
    /// Has violations but the case is still open
    OpenCase = 2,
    /// Everything else, oldest check first
    Backfill = 3,
}

impl CandidateTier {
    /// Map the tier number produced by the candidate query
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            1 => CandidateTier::CitationWindow,
            2 => CandidateTier::OpenCase,
            _ => CandidateTier::Backfill,
        }
    }
}

/// An inspection selected for a violation recheck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationCandidate {
    /// Activity number
    pub activity_nr: String,

    /// Priority tier
    pub tier: CandidateTier,

    /// Inspection open date
    pub open_date: NaiveDate,

    /// Previous check, if any
    pub last_violation_check: Option<DateTime<Utc>>,
}

/// Resume point of the incremental inspection sync
///
/// Ordered by timestamp, then by `consumed`. The next run asks for records
/// published at or after `published_at` and skips the first `consumed` of
/// them, so a batch sharing one publication timestamp can span runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncWatermark {
    /// Newest publication timestamp ingested
    pub published_at: DateTime<Utc>,

    /// Records at or after `published_at` already consumed, in remote order
    pub consumed: u32,
}

impl SyncWatermark {
    pub fn new(published_at: DateTime<Utc>, consumed: u32) -> Self {
        Self {
            published_at,
            consumed,
        }
    }

    /// Account for the next record in remote order
    ///
    /// `published_at` is `None` for a record whose timestamp could not be
    /// read; it still occupies a position after the current timestamp.
    pub fn observe(current: Option<Self>, published_at: Option<DateTime<Utc>>) -> Option<Self> {
        match (current, published_at) {
            (Some(w), Some(ts)) if ts > w.published_at => Some(Self::new(ts, 1)),
            (Some(w), Some(ts)) if ts < w.published_at => Some(w),
            (Some(w), _) => Some(Self::new(w.published_at, w.consumed.saturating_add(1))),
            (None, Some(ts)) => Some(Self::new(ts, 1)),
            (None, None) => None,
        }
    }
}
