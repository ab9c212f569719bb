//! Error taxonomy for the rename engine.
//!
//! One enum, one set of error codes. Internal failures (I/O, WAL parsing,
//! hash computation) convert into `RenameError` at the module boundary; they
//! never reach `RenameCoordinator` callers as raw `std::io::Error`.

use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RenameError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("source note not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("destination invalid: {}: {reason}", path.display())]
    DestinationInvalid { path: PathBuf, reason: String },

    #[error("content hash mismatch for {}: expected {expected}, found {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("transaction failed during {phase}: {reason}")]
    TransactionFailed { phase: String, reason: String },

    #[error("partial failure: {completed} of {total} link updates committed before rollback")]
    PartialFailure { completed: usize, total: usize },

    #[error(
        "unrecoverable: rollback failed for correlation {correlation_id}, WAL retained at {}",
        wal_path.display()
    )]
    Unrecoverable {
        correlation_id: Uuid,
        wal_path: PathBuf,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RenameError {
    /// The error code surfaced to callers, matching the taxonomy exactly.
    pub fn code(&self) -> &'static str {
        match self {
            RenameError::InvalidInput { .. } => "INVALID_INPUT",
            RenameError::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            RenameError::DestinationInvalid { .. } => "DESTINATION_INVALID",
            RenameError::HashMismatch { .. } => "HASH_MISMATCH",
            RenameError::TransactionFailed { .. } => "TRANSACTION_FAILED",
            RenameError::PartialFailure { .. } => "PARTIAL_FAILURE",
            RenameError::Unrecoverable { .. } => "UNRECOVERABLE",
            RenameError::Io(_) => "TRANSACTION_FAILED",
        }
    }
}
