use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur within the job store and run history.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    /// Another job already uses this name.
    #[error("Job name already in use: {name}")]
    DuplicateJobName { name: String },

    /// The run already reached a terminal status; finalized rows are immutable.
    #[error("Run already finalized: {id}")]
    RunFinalized { id: String },

    /// A stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) | StoreError::Io(_) => "STORE_IO_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::JobNotFound { .. } => "JOB_NOT_FOUND",
            StoreError::RunNotFound { .. } => "RUN_NOT_FOUND",
            StoreError::DuplicateJobName { .. } => "DUPLICATE_JOB_NAME",
            StoreError::RunFinalized { .. } => "RUN_FINALIZED",
            StoreError::Corrupt(_) => "CORRUPT_RECORD",
        }
    }

    /// Transient failures worth retrying: the database was busy or locked,
    /// or the disk misbehaved. Constraint, schema and decoding errors are not.
    pub fn is_io(&self) -> bool {
        match self {
            StoreError::Io(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
