//! Application error types for osha-ingest
//!
//! This module defines common error types used throughout the application.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::config::ConfigError;
use crate::otel::OtelError;

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection-level failure of the background SQLite worker
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::Sqlite(e),
            other => DbError::Connection(other.to_string()),
        }
    }
}

/// Errors surfaced by the remote API client and the job runner
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream after the cooldown retry
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// A run of the same job is already in flight
    #[error("Job already running: {0}")]
    JobBusy(String),
}

/// A single remote record that could not be turned into a domain record
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    /// Required field absent or empty
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Field present but unparseable
    #[error("Invalid value for {field}: {value}")]
    InvalidField {
        /// Field name
        field: String,
        /// Raw value as received
        value: String,
    },

    /// Record is not a JSON object
    #[error("Record is not an object")]
    NotAnObject,
}

/// Application-level error type
///
/// This is the main error type used throughout the application.
/// It aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Telemetry setup error
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] OtelError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            SyncError::NetworkTimeout => true,
            SyncError::ConnectionRefused => true,
            SyncError::RateLimited(_) => true,
            SyncError::ServerError(code) if *code >= 500 => true,
            SyncError::Network(_) => true,

            // Non-retryable errors
            SyncError::InvalidData(_) => false,
            SyncError::NotFound => false,
            SyncError::Unauthorized => false,
            SyncError::ServerError(_) => false, // 4xx errors
            SyncError::JobBusy(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: SyncError messages with parameters
    #[test]
    fn test_sync_error_messages() {
        assert_eq!(SyncError::NetworkTimeout.to_string(), "Network timeout");
        assert_eq!(
            SyncError::RateLimited(120).to_string(),
            "Rate limited, retry after 120 seconds"
        );
        assert_eq!(
            SyncError::ServerError(503).to_string(),
            "Server error: HTTP 503"
        );
        assert_eq!(
            SyncError::JobBusy("inspection_sync".to_string()).to_string(),
            "Job already running: inspection_sync"
        );
    }

    // Test 2: From trait conversion for SyncError
    #[test]
    fn test_app_error_from_sync_error() {
        let app_err: AppError = SyncError::NetworkTimeout.into();

        match app_err {
            AppError::Sync(SyncError::NetworkTimeout) => (),
            _ => panic!("Expected AppError::Sync(SyncError::NetworkTimeout)"),
        }
    }

    // Test 3: RetryableError trait for SyncError
    #[test]
    fn test_sync_error_retryable() {
        assert!(SyncError::NetworkTimeout.is_retryable());
        assert!(SyncError::ConnectionRefused.is_retryable());
        assert!(SyncError::RateLimited(30).is_retryable());
        assert!(SyncError::ServerError(502).is_retryable());
        assert!(SyncError::Network("connection reset".to_string()).is_retryable());

        assert!(!SyncError::InvalidData("bad format".to_string()).is_retryable());
        assert!(!SyncError::NotFound.is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::ServerError(400).is_retryable());
        assert!(!SyncError::JobBusy("x".to_string()).is_retryable());
    }

    // Test 4: RecordError messages
    #[test]
    fn test_record_error_messages() {
        assert_eq!(
            RecordError::MissingField("activity_nr".to_string()).to_string(),
            "Missing field: activity_nr"
        );
        assert_eq!(
            RecordError::InvalidField {
                field: "open_date".to_string(),
                value: "yesterday".to_string(),
            }
            .to_string(),
            "Invalid value for open_date: yesterday"
        );
    }

    // Test 5: DbError messages
    #[test]
    fn test_db_error_messages() {
        assert_eq!(DbError::NotFound.to_string(), "Record not found");
        assert_eq!(
            DbError::Migration("create \"data\": denied".to_string()).to_string(),
            "Migration error: create \"data\": denied"
        );
    }

    // Test 6: DbError from rusqlite::Error, directly and through tokio-rusqlite
    #[test]
    fn test_db_error_from_sqlite() {
        let db_err: DbError = rusqlite::Error::InvalidParameterName("test".to_string()).into();
        assert!(matches!(db_err, DbError::Sqlite(_)));

        let wrapped = tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows);
        let db_err: DbError = wrapped.into();
        assert!(matches!(
            db_err,
            DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)
        ));

        let db_err: DbError = tokio_rusqlite::Error::ConnectionClosed.into();
        assert!(matches!(db_err, DbError::Connection(_)));
    }

    // Test 7: AppError display includes source error
    #[test]
    fn test_app_error_display() {
        let app_err = AppError::Sync(SyncError::RateLimited(120));
        assert_eq!(
            app_err.to_string(),
            "Sync error: Rate limited, retry after 120 seconds"
        );

        let app_err: AppError = ConfigError::InvalidValue("page_size".to_string()).into();
        assert_eq!(
            app_err.to_string(),
            "Configuration error: Invalid configuration value: page_size"
        );
    }
}
