//! Error types for convledger.
//!
//! This module defines all error types used throughout the convledger crate.
//! Domain failures (unknown participants, closed sessions, integrity
//! violations) are distinct variants so callers can react to them without
//! inspecting messages.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// The main error type for convledger operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Ledger Errors ===
    /// A bot type outside the fixed enumeration was supplied.
    #[error("invalid bot type '{value}' (expected emotional, cognitive, motivational or neutral)")]
    InvalidBotType {
        /// The rejected value.
        value: String,
    },

    /// A sender other than `user` or `bot` was supplied.
    #[error("invalid sender '{value}' (expected user or bot)")]
    InvalidSender {
        /// The rejected value.
        value: String,
    },

    /// A severity level other than high, medium or low was supplied.
    #[error("invalid severity level '{value}' (expected high, medium or low)")]
    InvalidSeverity {
        /// The rejected value.
        value: String,
    },

    /// No participant exists with the given id.
    #[error("unknown participant '{participant_id}'")]
    UnknownParticipant {
        /// The participant id that was looked up.
        participant_id: String,
    },

    /// The participant's session has already been closed.
    #[error("session for participant '{participant_id}' is closed")]
    SessionClosed {
        /// The participant whose session is closed.
        participant_id: String,
    },

    /// The participant has already sent the full quota of user messages.
    #[error("participant '{participant_id}' has reached the quota of {quota} user messages")]
    QuotaExceeded {
        /// The participant that hit the quota.
        participant_id: String,
        /// The configured quota.
        quota: u32,
    },

    /// A record references a participant, message or flag that does not
    /// exist, or that belongs to a different participant.
    #[error("referential integrity violation: {message}")]
    ReferentialIntegrityViolation {
        /// Description of the broken reference.
        message: String,
    },

    /// A crisis flag for the same message and keyword already exists.
    #[error("duplicate crisis flag for message {message_id} and keyword '{keyword}'")]
    DuplicateFlag {
        /// The flagged message.
        message_id: i64,
        /// The keyword that was already flagged.
        keyword: String,
    },

    /// An export audit entry is missing required fields.
    #[error("invalid export record: {message}")]
    InvalidExportRequest {
        /// What was wrong with the request.
        message: String,
    },

    // === Storage Errors ===
    /// The database is busy or locked by another writer.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Description reported by the storage layer.
        message: String,
    },

    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for convledger operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::StorageUnavailable {
                    message: err.to_string(),
                }
            }
            _ => Self::DatabaseQuery(err),
        }
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an unknown participant error.
    #[must_use]
    pub fn unknown_participant(participant_id: impl Into<String>) -> Self {
        Self::UnknownParticipant {
            participant_id: participant_id.into(),
        }
    }

    /// Create a referential integrity error.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::ReferentialIntegrityViolation {
            message: message.into(),
        }
    }

    /// Check if the caller may retry the operation with backoff.
    ///
    /// Only storage contention is retryable; the ledger never retries a write
    /// on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    /// Check if this error was caused by a constraint violation in `SQLite`.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::DatabaseQuery(err) => {
                err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
            }
            _ => false,
        }
    }
}
