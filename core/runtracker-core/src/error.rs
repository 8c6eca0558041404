//! Error types for runtracker-core operations.
//!
//! "Not found" is never an error here: lookups return `Ok(None)`. Samples that
//! arrive without an active run are dropped and logged by the manager, so they
//! never show up as errors either.

use std::path::PathBuf;

/// All errors that can occur in runtracker-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Run store failure: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Run store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Already tracking run {run_id}; stop it before starting another")]
    AlreadyTracking { run_id: i64 },

    #[error("Run has not been saved to the run store")]
    UnsavedRun,

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    // ─────────────────────────────────────────────────────────────────────
    // Delivery Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Location source unavailable: {0}")]
    SourceUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O and Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,
}

impl TrackerError {
    pub(crate) fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        TrackerError::Store {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TrackerError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        TrackerError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using TrackerError.
pub type Result<T> = std::result::Result<T, TrackerError>;
