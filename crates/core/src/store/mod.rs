//! Persistence contract
//!
//! The store is the only shared state between scheduler nodes: due-job
//! lookup, unique locks, heartbeats and workflow checkpoints all go through
//! it. `cadence-infra` provides a key-value backed implementation.

pub mod error;
pub mod ports;

pub use error::{StoreError, StoreResult};
pub use ports::{ExecutionStore, JobStore, LockStore, Store, WorkflowStore};

/// Lock key guarding a unique job against concurrent executions
pub fn unique_lock_key(job: &str) -> String {
    format!("unique:{job}")
}

/// Lock key that lets exactly one node claim a scheduled instance of a job
pub fn claim_lock_key(job: &str, scheduled_at_ms: i64) -> String {
    format!("claim:{job}:{scheduled_at_ms}")
}
