// src/error.rs

use thiserror::Error;

/// Core error types for Strata
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store initialization error
    #[error("Failed to initialize store: {0}")]
    InitError(String),

    /// Referenced key or list does not resolve to a live head
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted create collides with an existing live head
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("Concurrency conflict on '{key}': expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    /// UPDATE affected no rows despite a prior existence check
    #[error("Write failed for '{0}': no rows affected")]
    WriteFailed(String),

    /// Schema or constraint violation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Operation requires a feature flag that is disabled
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Manifest invalid or unknown file format
    #[error("Format error: {0}")]
    Format(String),

    /// Export data file checksum did not match its manifest entry
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// SQL parse failure with source position
    #[error("SQL parse error: {message} at line {line}, column {column}")]
    SqlParse {
        message: String,
        line: usize,
        column: usize,
    },

    /// Caller cancellation observed
    #[error("Operation cancelled")]
    Cancelled,

    /// One or more items of a batch operation failed
    #[error("Batch operation failed: {} item(s) errored", failures.len())]
    BatchFailed { failures: Vec<BatchItemError> },
}

/// Per-item cause inside an aggregated batch failure
#[derive(Debug)]
pub struct BatchItemError {
    /// Index of the item within the caller's input
    pub index: usize,
    /// Logical key of the failing entity, when known
    pub key: String,
    /// Rendered cause
    pub cause: String,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Format(format!("JSON error: {}", err))
    }
}

impl Error {
    /// Whether this error stems from a transient backend condition
    /// (busy, locked, I/O) that a retry may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using Strata's Error type
pub type Result<T> = std::result::Result<T, Error>;
