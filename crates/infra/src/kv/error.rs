//! Key-value backend errors

use cadence_core::store::StoreError;
use thiserror::Error;

/// Result type alias for backend operations
pub type KvResult<T> = Result<T, KvError>;

/// Failures reported by a [`KvBackend`](super::KvBackend)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The key holds a value of another kind (string vs hash vs list ...)
    #[error("Key '{key}' does not hold a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_into_store_backend_error() {
        let err: StoreError =
            KvError::WrongType { key: "cadence:jobs".into(), expected: "hash" }.into();
        assert_eq!(err, StoreError::Backend("Key 'cadence:jobs' does not hold a hash".into()));
    }
}
