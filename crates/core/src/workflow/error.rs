//! Workflow error types

use cadence_domain::{CadenceError, RunStatus};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::strategy::StrategyError;

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("Workflow '{workflow}' declares step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("Step '{step}' in '{workflow}' depends on unknown '{dependency}'")]
    MissingDependency { workflow: String, step: String, dependency: String },

    #[error("Workflow '{workflow}' has a dependency cycle through {steps:?}")]
    CycleDetected { workflow: String, steps: Vec<String> },

    #[error("Invalid workflow '{workflow}': {message}")]
    InvalidDefinition { workflow: String, message: String },

    #[error("No handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Workflow run {0} not found")]
    RunNotFound(Uuid),

    #[error("Workflow run {id} is {status}, expected {expected}")]
    InvalidRunState { id: Uuid, status: RunStatus, expected: RunStatus },

    #[error("Workflow nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

impl WorkflowError {
    /// Whether the definition itself is at fault
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyWorkflow(_)
                | Self::DuplicateStep { .. }
                | Self::MissingDependency { .. }
                | Self::CycleDetected { .. }
                | Self::InvalidDefinition { .. }
                | Self::HandlerNotFound(_)
        )
    }
}

impl From<WorkflowError> for CadenceError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Store(e) => e.into(),
            WorkflowError::Strategy(e) => e.into(),
            WorkflowError::WorkflowNotFound(_) | WorkflowError::RunNotFound(_) => {
                CadenceError::NotFound(err.to_string())
            }
            e if e.is_definition_error() => CadenceError::InvalidInput(e.to_string()),
            e => CadenceError::Workflow(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_errors_map_to_invalid_input() {
        let err = WorkflowError::CycleDetected {
            workflow: "orders".into(),
            steps: vec!["a".into(), "b".into()],
        };
        assert!(err.is_definition_error());
        assert!(matches!(CadenceError::from(err), CadenceError::InvalidInput(_)));

        let err = WorkflowError::InvalidRunState {
            id: Uuid::nil(),
            status: RunStatus::Completed,
            expected: RunStatus::Awaiting,
        };
        assert!(err.to_string().contains("is completed, expected awaiting"));
        assert!(matches!(CadenceError::from(err), CadenceError::Workflow(_)));
    }
}
