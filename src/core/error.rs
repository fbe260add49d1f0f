use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CarapaceError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Tier violation on '{entity}': {reason}")]
    TierViolation { entity: String, reason: String },
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Malformed dismissal: {0}")]
    MalformedDismissal(String),
    #[error("Review timed out after {0}s")]
    ReviewTimeout(u64),
    #[error("Reviewer unavailable: {0}")]
    ReviewUnavailable(String),
    #[error("Unparsable verdict: {0}")]
    UnparsableVerdict(String),
    #[error("Lock contention on '{0}'")]
    LockContention(String),
    #[error("Stale lock on '{0}'")]
    StaleLock(String),
    #[error("Blocker not found: {0}")]
    BlockerNotFound(String),
    #[error("Corrupt graph log at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },
}

impl CarapaceError {
    /// Short machine-readable code used in CLI envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            CarapaceError::RusqliteError(_) => "SQLITE",
            CarapaceError::IoError(_) => "IO",
            CarapaceError::JsonError(_) => "JSON",
            CarapaceError::ConfigError(_) => "CONFIG",
            CarapaceError::ValidationError(_) => "VALIDATION",
            CarapaceError::NotFound(_) => "NOT_FOUND",
            CarapaceError::TierViolation { .. } => "TIER_VIOLATION",
            CarapaceError::UnknownEntity(_) => "UNKNOWN_ENTITY",
            CarapaceError::UnknownTask(_) => "UNKNOWN_TASK",
            CarapaceError::MalformedDismissal(_) => "MALFORMED_DISMISSAL",
            CarapaceError::ReviewTimeout(_) => "REVIEW_TIMEOUT",
            CarapaceError::ReviewUnavailable(_) => "REVIEW_UNAVAILABLE",
            CarapaceError::UnparsableVerdict(_) => "UNPARSABLE_VERDICT",
            CarapaceError::LockContention(_) => "LOCK_CONTENTION",
            CarapaceError::StaleLock(_) => "STALE_LOCK",
            CarapaceError::BlockerNotFound(_) => "BLOCKER_NOT_FOUND",
            CarapaceError::CorruptLog { .. } => "CORRUPT_LOG",
        }
    }
}
