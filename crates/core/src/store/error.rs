//! Store error types

use cadence_domain::CadenceError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by a [`Store`](super::Store) backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("Workflow run {0} not found")]
    RunNotFound(Uuid),

    #[error("Lock '{key}' is held by '{owner}'")]
    LockConflict { key: String, owner: String },

    #[error("Stored value under '{key}' is corrupt: {message}")]
    Corrupt { key: String, message: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_)
                | Self::WorkflowNotFound(_)
                | Self::ExecutionNotFound(_)
                | Self::RunNotFound(_)
        )
    }
}

impl From<StoreError> for CadenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockConflict { .. } => CadenceError::LockConflict(err.to_string()),
            e if e.is_not_found() => CadenceError::NotFound(e.to_string()),
            e => CadenceError::Store(e.to_string()),
        }
    }
}
