//! Violation domain models

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::remote;
use crate::error::RecordError;

/// A citation issued against one inspection
///
/// Keyed by (`activity_nr`, `citation_id`); never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Owning inspection
    pub activity_nr: String,

    /// Citation identifier within the inspection
    pub citation_id: String,

    /// Date the citation was issued
    pub issuance_date: Option<NaiveDate>,

    /// Violation classification (serious, willful, repeat, other)
    pub viol_type: Option<String>,

    /// Cited standard
    pub standard: Option<String>,

    /// Gravity rating
    pub gravity: Option<String>,

    /// Current penalty amount
    pub current_penalty: f64,

    /// Initial penalty amount
    pub initial_penalty: f64,

    /// Number of employees exposed
    pub nr_exposed: Option<i64>,
}

impl ViolationRecord {
    /// Create a record with the key fields only
    pub fn new(activity_nr: impl Into<String>, citation_id: impl Into<String>) -> Self {
        Self {
            activity_nr: activity_nr.into(),
            citation_id: citation_id.into(),
            issuance_date: None,
            viol_type: None,
            standard: None,
            gravity: None,
            current_penalty: 0.0,
            initial_penalty: 0.0,
            nr_exposed: None,
        }
    }

    /// Set both penalty amounts
    pub fn with_penalties(mut self, current: f64, initial: f64) -> Self {
        self.current_penalty = current;
        self.initial_penalty = initial;
        self
    }

    /// Parse a raw API record
    pub fn from_remote(raw: &Value) -> Result<Self, RecordError> {
        let obj = remote::as_object(raw)?;

        Ok(Self {
            activity_nr: remote::req_str(obj, "activity_nr")?,
            citation_id: remote::req_str(obj, "citation_id")?,
            issuance_date: remote::opt_date(obj, "issuance_date")?,
            viol_type: remote::opt_str(obj, "viol_type"),
            standard: remote::opt_str(obj, "standard"),
            gravity: remote::opt_str(obj, "gravity"),
            current_penalty: remote::amount(obj, "current_penalty"),
            initial_penalty: remote::amount(obj, "initial_penalty"),
            nr_exposed: remote::opt_int(obj, "nr_exposed"),
        })
    }
}

/// Result of inserting a single violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    /// New row
    Inserted,
    /// Key already present; nothing written
    Duplicate,
}

/// Result of applying one violation check to an inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCheckOutcome {
    /// Violations not seen before
    pub inserted: u32,
    /// Violations already stored
    pub duplicates: u32,
}
