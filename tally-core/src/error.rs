//! Error types for tally operations

use thiserror::Error;

/// Saved-object store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Saved object not found: {object_type} with id {id}")]
    NotFound { object_type: String, id: String },

    #[error("Version conflict on {object_type} with id {id}")]
    Conflict { object_type: String, id: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Invalid sort field: {field}")]
    InvalidSortField { field: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict { .. }
                | StorageError::Unavailable { .. }
                | StorageError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Task scheduling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task type already registered: {task_type}")]
    AlreadyRegistered { task_type: String },

    #[error("Task type not registered: {task_type}")]
    NotRegistered { task_type: String },

    #[error("Task instance not found: {task_id}")]
    NotFound { task_id: String },

    #[error("Task {task_id} run failed: {reason}")]
    RunFailed { task_id: String, reason: String },

    #[error("Task {task_id} run was cancelled")]
    Cancelled { task_id: String },

    #[error("Task {task_id} exceeded its timeout of {timeout_ms}ms")]
    TimedOut { task_id: String, timeout_ms: u64 },
}

/// Incremental id assignment errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IncrementalIdError {
    #[error(
        "Failed to apply incremental id {attempted_id} to case {case_id} after {attempts} attempts: {source}"
    )]
    RetriesExhausted {
        case_id: String,
        attempted_id: u64,
        attempts: u32,
        source: StorageError,
    },

    #[error("Case {case_id} already has incremental id {existing}")]
    AlreadyAssigned { case_id: String, existing: u64 },

    #[error("Remove `incremental_id` from the cases before importing ({count} offending objects)")]
    ImportRejected { count: usize },
}

/// Master error type for all tally errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Incremental id error: {0}")]
    IncrementalId(#[from] IncrementalIdError),
}

impl TallyError {
    /// Transient errors are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            TallyError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Storage(StorageError::from(err))
    }
}

/// Result type alias for tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
