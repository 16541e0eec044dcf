//! Database migrations for osha-ingest
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Inspections, keyed by remote activity number
CREATE TABLE IF NOT EXISTS inspections (
    activity_nr TEXT PRIMARY KEY,
    estab_name TEXT,
    site_address TEXT,
    site_city TEXT,
    site_state TEXT,
    site_zip TEXT,
    naics_code TEXT,
    insp_type TEXT,
    open_date TEXT NOT NULL,
    close_case_date TEXT,
    published_at TEXT NOT NULL,
    total_current_penalty REAL NOT NULL DEFAULT 0,
    total_initial_penalty REAL NOT NULL DEFAULT 0,
    last_violation_check TEXT,
    violation_check_count INTEGER NOT NULL DEFAULT 0,
    new_violations_detected INTEGER NOT NULL DEFAULT 0,
    new_violations_count INTEGER NOT NULL DEFAULT 0,
    new_violations_at TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_inspections_open_date ON inspections(open_date);
CREATE INDEX IF NOT EXISTS idx_inspections_published_at ON inspections(published_at);
CREATE INDEX IF NOT EXISTS idx_inspections_last_check ON inspections(last_violation_check);

-- Violations, one row per citation
CREATE TABLE IF NOT EXISTS violations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    activity_nr TEXT NOT NULL REFERENCES inspections(activity_nr),
    citation_id TEXT NOT NULL,
    issuance_date TEXT,
    viol_type TEXT,
    standard TEXT,
    gravity TEXT,
    current_penalty REAL NOT NULL DEFAULT 0,
    initial_penalty REAL NOT NULL DEFAULT 0,
    nr_exposed INTEGER,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(activity_nr, citation_id)
);

CREATE INDEX IF NOT EXISTS idx_violations_activity ON violations(activity_nr);

-- Process-wide scalars (sync watermark)
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Job execution history
CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    fired_by TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    details TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job_time ON job_runs(job_name, started_at DESC);
"#;

/// Key of the inspection watermark row in `sync_state`
pub const WATERMARK_KEY: &str = "inspection_watermark";

/// Key of the count of records consumed at the watermark timestamp
pub const WATERMARK_CONSUMED_KEY: &str = "inspection_watermark_consumed";

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}
