//! Strategy error types

use std::time::Duration;

use cadence_common::CommonError;
use cadence_domain::CadenceError;
use thiserror::Error;

/// Result type alias for strategy operations
pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Circuit '{circuit}' is open")]
    CircuitOpen { circuit: String, retry_after: Option<Duration> },

    #[error("Rate limit for '{scope}' exhausted, retry in {retry_after:?}")]
    RateLimited { scope: String, retry_after: Duration },

    #[error("Invalid strategy configuration: {0}")]
    InvalidConfig(String),

    #[error("Strategy runner is not running")]
    Unavailable,
}

impl StrategyError {
    /// Whether the call should be deferred rather than failed
    pub fn is_deferral(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimited { .. })
    }

    /// How long to wait before asking again, when known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<StrategyError> for CommonError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::CircuitOpen { circuit, retry_after: Some(after) } => {
                CommonError::circuit_breaker_with_retry(circuit, after)
            }
            StrategyError::CircuitOpen { circuit, retry_after: None } => {
                CommonError::circuit_breaker(circuit)
            }
            StrategyError::RateLimited { retry_after, .. } => {
                CommonError::rate_limited(retry_after)
            }
            StrategyError::InvalidConfig(message) => CommonError::config(message),
            StrategyError::Unavailable => CommonError::internal("strategy runner is not running"),
        }
    }
}

impl From<StrategyError> for CadenceError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::CircuitOpen { circuit, .. } => CadenceError::CircuitOpen(circuit),
            StrategyError::RateLimited { retry_after, .. } => {
                CadenceError::RateLimited(retry_after.as_millis() as u64)
            }
            StrategyError::InvalidConfig(message) => CadenceError::Config(message),
            StrategyError::Unavailable => CadenceError::Internal(err.to_string()),
        }
    }
}
