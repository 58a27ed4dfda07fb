//! Error types used throughout Cadence

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cross-layer error for Cadence
///
/// Module errors (store, strategy, workflow, scheduler) convert into this
/// type at crate boundaries. It serializes with a `type` tag so it can be
/// persisted on execution records and shipped to dashboards unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Rate limited: retry after {0}ms")]
    RateLimited(u64),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadenceError {
    /// Whether the caller should simply try again later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockConflict(_) | Self::CircuitOpen(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias for Cadence operations
pub type Result<T> = std::result::Result<T, CadenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_type_tag() {
        let err = CadenceError::NotFound("job 'nightly'".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"type":"NotFound","message":"job 'nightly'"}"#);

        let back: CadenceError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_transient_classification() {
        assert!(CadenceError::RateLimited(100).is_transient());
        assert!(CadenceError::LockConflict("k".into()).is_transient());
        assert!(!CadenceError::Workflow("cycle".into()).is_transient());
        assert_eq!(CadenceError::RateLimited(250).to_string(), "Rate limited: retry after 250ms");
    }
}
