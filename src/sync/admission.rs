//! Admission filter
//!
//! Decides whether a fetched inspection is stored at all. Every ingestion
//! path shares the instance built from configuration.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::IngestConfig;
use crate::models::InspectionRecord;

/// Why a record was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// open_date year below the cutoff
    BeforeCutoff { year: i32, cutoff: i32 },
    /// site state outside the allow-list (or missing while a list is set)
    OutOfRegion(Option<String>),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BeforeCutoff { year, cutoff } => {
                write!(f, "opened in {}, before cutoff year {}", year, cutoff)
            }
            RejectReason::OutOfRegion(Some(state)) => write!(f, "state {} not admitted", state),
            RejectReason::OutOfRegion(None) => write!(f, "no site state"),
        }
    }
}

/// Result of [`AdmissionFilter::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(RejectReason),
}

impl Admission {
    pub fn is_accept(&self) -> bool {
        matches!(self, Admission::Accept)
    }
}

/// Cutoff year plus optional state allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionFilter {
    cutoff_year: i32,
    allowed_states: BTreeSet<String>,
}

impl AdmissionFilter {
    /// Filter admitting every state
    pub fn new(cutoff_year: i32) -> Self {
        Self {
            cutoff_year,
            allowed_states: BTreeSet::new(),
        }
    }

    /// Restrict admission to the given state codes (case-insensitive)
    pub fn with_allowed_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_states = states
            .into_iter()
            .map(|s| s.as_ref().trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.cutoff_year).with_allowed_states(&config.allowed_states)
    }

    pub fn cutoff_year(&self) -> i32 {
        self.cutoff_year
    }

    pub fn decide(&self, record: &InspectionRecord) -> Admission {
        let year = record.open_year();
        if year < self.cutoff_year {
            return Admission::Reject(RejectReason::BeforeCutoff {
                year,
                cutoff: self.cutoff_year,
            });
        }

        if !self.allowed_states.is_empty() {
            let state = record.site_state.as_deref().map(str::to_uppercase);
            let admitted = state
                .as_deref()
                .is_some_and(|s| self.allowed_states.contains(s));
            if !admitted {
                return Admission::Reject(RejectReason::OutOfRegion(state));
            }
        }

        Admission::Accept
    }
}
