//! Ingestion engine
//!
//! # Components
//!
//! - [`retry`]: call state machine (pacing cooldown and network retries)
//! - [`http_client`]: the rate-limited client, sole caller of the remote API
//! - [`admission`]: cutoff and region filter applied before storage
//! - [`inspections`]: incremental inspection sync driven by the watermark
//! - [`violations`]: tiered recheck of stored inspections for new citations
//! - [`scheduler`]: interval and daily triggers, single-flight per job
//!
//! # Example
//!
//! ```ignore
//! use osha_ingest::sync::{InspectionSyncer, RunBounds};
//!
//! let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let report = syncer.run(&RunBounds::records(500), &stop_rx).await;
//! println!("{} inserted, stopped by {:?}", report.inserted, report.stop_reason);
//! ```

pub mod admission;
pub mod http_client;
pub mod inspections;
pub mod retry;
pub mod scheduler;
pub mod violations;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::{JobKind, RunStatus};

// Re-export main types for convenience
pub use admission::{Admission, AdmissionFilter, RejectReason};
pub use http_client::{InspectionQuery, OshaApi, RateLimitedClient, ViolationQuery};
pub use inspections::{InspectionSyncReport, InspectionSyncer};
pub use retry::{CallOutcome, CallState, RetryPolicy};
pub use scheduler::{
    EngineStatus, Job, JobStatus, Scheduler, SchedulerHandle, SchedulerSettings, TriggerKind,
};
pub use violations::{ViolationSyncReport, ViolationWatcher};

/// Why a run ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Ran out of work
    #[default]
    Completed,
    /// Hit the per-run record cap
    RecordCap,
    /// Hit the per-run call cap
    CallCap,
    /// Stop signal observed between units of work
    Cancelled,
    /// The remote API kept answering 429 after the cooldown retry
    RateLimited,
    /// Any other client failure
    ClientError(String),
    /// The store rejected a read or write
    StoreError(String),
}

impl StopReason {
    /// Map a client failure that ended a run
    pub fn from_client(err: &SyncError) -> Self {
        match err {
            SyncError::RateLimited(_) => StopReason::RateLimited,
            other => StopReason::ClientError(other.to_string()),
        }
    }

    /// Run status recorded for this reason
    pub fn status(&self) -> RunStatus {
        match self {
            StopReason::Completed | StopReason::RecordCap | StopReason::CallCap => {
                RunStatus::Succeeded
            }
            StopReason::Cancelled | StopReason::RateLimited => RunStatus::Partial,
            StopReason::ClientError(_) | StopReason::StoreError(_) => RunStatus::Failed,
        }
    }

    /// Error text persisted with the run, if any
    pub fn error_message(&self) -> Option<String> {
        match self {
            StopReason::RateLimited => Some("rate limited by remote API".to_string()),
            StopReason::ClientError(msg) => Some(msg.clone()),
            StopReason::StoreError(msg) => Some(format!("store: {}", msg)),
            _ => None,
        }
    }
}

/// Explicit per-run bounds; `None` falls back to configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBounds {
    /// Records fetched by an inspection sync
    pub max_records: Option<u32>,
    /// Remote calls made by an inspection sync
    pub max_calls: Option<u32>,
    /// Candidates checked by a violation watch
    pub max_inspections: Option<u32>,
}

impl RunBounds {
    /// Bounds with only a record cap
    pub fn records(max_records: u32) -> Self {
        Self {
            max_records: Some(max_records),
            ..Self::default()
        }
    }

    /// Bounds with only a candidate cap
    pub fn inspections(max_inspections: u32) -> Self {
        Self {
            max_inspections: Some(max_inspections),
            ..Self::default()
        }
    }
}

/// Report of any job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    InspectionSync(InspectionSyncReport),
    ViolationWatch(ViolationSyncReport),
}

impl JobReport {
    pub fn kind(&self) -> JobKind {
        match self {
            JobReport::InspectionSync(_) => JobKind::InspectionSync,
            JobReport::ViolationWatch(_) => JobKind::ViolationWatch,
        }
    }

    pub fn stop_reason(&self) -> &StopReason {
        match self {
            JobReport::InspectionSync(r) => &r.stop_reason,
            JobReport::ViolationWatch(r) => &r.stop_reason,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.stop_reason().status()
    }

    /// Calls made against the remote API
    pub fn calls(&self) -> u32 {
        match self {
            JobReport::InspectionSync(r) => r.calls,
            JobReport::ViolationWatch(r) => r.calls,
        }
    }
}
