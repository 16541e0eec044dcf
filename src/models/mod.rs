//! Domain models for osha-ingest
//!
//! This module contains the core domain models used throughout the application.

pub mod inspection;
pub mod remote;
pub mod run;
pub mod violation;

// Re-export commonly used types
pub use inspection::{
    CandidateTier, InspectionRecord, StoredInspection, SyncWatermark, UpsertOutcome,
    ViolationCandidate,
};
pub use run::{JobKind, JobRun, RunStatus};
pub use violation::{InsertOutcome, ViolationCheckOutcome, ViolationRecord};
