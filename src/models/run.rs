//! Job run models
//!
//! This module defines the scheduled job kinds and the persisted record of
//! each job execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two scheduled jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Incremental inspection sync
    InspectionSync,
    /// Tiered violation recheck
    ViolationWatch,
}

impl JobKind {
    /// Stable name used in logs, metrics and the job_runs table
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::InspectionSync => "inspection_sync",
            JobKind::ViolationWatch => "violation_watch",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inspection_sync" => Ok(JobKind::InspectionSync),
            "violation_watch" => Ok(JobKind::ViolationWatch),
            _ => Err(format!("Invalid job kind: {}", s)),
        }
    }
}

/// Final status of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Ran to a natural end or a configured bound
    Succeeded,
    /// Stopped early by rate limiting or cancellation; results so far are kept
    Partial,
    /// Stopped by a client or store failure
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Persisted record of one job execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Database ID (set after insertion)
    pub id: Option<i64>,

    /// Which job ran
    pub job: JobKind,

    /// Final status
    pub status: RunStatus,

    /// What fired the run (`interval`, `daily`, `startup`, `manual`)
    pub trigger: String,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// End time
    pub finished_at: DateTime<Utc>,

    /// Run report as JSON
    pub details: Option<String>,

    /// Failure description, if any
    pub error: Option<String>,
}
