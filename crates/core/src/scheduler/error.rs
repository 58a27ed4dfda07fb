//! Scheduler error types

use std::time::Duration;

use cadence_common::{CronParseError, ScheduleError};
use cadence_domain::CadenceError;
use thiserror::Error;

use crate::store::StoreError;
use crate::strategy::StrategyError;
use crate::workflow::WorkflowError;

/// Result type alias for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronParseError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Invalid job '{job}': {message}")]
    InvalidJob { job: String, message: String },

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Timed out after {0:?} waiting for the scheduler to stop")]
    Timeout(Duration),

    #[error("Background task failed: {0}")]
    TaskJoinFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl SchedulerError {
    pub(crate) fn invalid(job: &str, message: impl Into<String>) -> Self {
        Self::InvalidJob { job: job.to_string(), message: message.into() }
    }
}

impl From<SchedulerError> for CadenceError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Cron(_) | SchedulerError::Schedule(_) => {
                CadenceError::Schedule(err.to_string())
            }
            SchedulerError::InvalidJob { .. } => CadenceError::InvalidInput(err.to_string()),
            SchedulerError::JobNotFound(_) => CadenceError::NotFound(err.to_string()),
            SchedulerError::Timeout(_) => CadenceError::Timeout(err.to_string()),
            SchedulerError::Store(inner) => inner.into(),
            SchedulerError::Strategy(inner) => inner.into(),
            SchedulerError::Workflow(inner) => inner.into(),
            SchedulerError::AlreadyRunning | SchedulerError::NotRunning => {
                CadenceError::Scheduler(err.to_string())
            }
            SchedulerError::TaskJoinFailed(_) => CadenceError::Internal(err.to_string()),
        }
    }
}
