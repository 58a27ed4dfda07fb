//! Pluggable strategy interfaces
//!
//! The runner owns one implementation of each and drives them from a single
//! task, so implementations take `&mut self` and need no locking.

use std::time::Duration;

use cadence_common::{CircuitSnapshot, CommonError};
use cadence_domain::RetryPolicy;

use super::classifier::{Classification, NextAction};
use super::error::StrategyResult;

/// How a finished call should be counted against its circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Failure that counts toward opening the circuit
    Failure,
    /// Failure unrelated to upstream health
    Neutral,
}

/// Named circuit breakers
pub trait CircuitBreakerStrategy: Send {
    /// Admit one call or fail with `CircuitOpen`
    fn allow(&mut self, circuit: &str) -> StrategyResult<()>;

    /// Return an admitted call that never ran
    fn release(&mut self, circuit: &str);

    fn record(&mut self, circuit: &str, outcome: CallOutcome);

    fn snapshot(&mut self, circuit: &str) -> CircuitSnapshot;

    fn reset(&mut self, circuit: &str);

    /// Periodic housekeeping
    fn tick(&mut self) {}
}

/// Rate limits keyed by scope and key
pub trait RateLimiterStrategy: Send {
    /// Take a token or fail with `RateLimited`
    fn acquire(&mut self, scope: &str, key: &str) -> StrategyResult<()>;

    /// Whether a token is available, without taking it
    fn check(&mut self, scope: &str, key: &str) -> bool;

    /// Adopt the quota an upstream API reported
    fn sync_from_headers(
        &mut self,
        scope: &str,
        key: &str,
        limit: Option<u64>,
        remaining: u64,
        reset_after: Option<Duration>,
    );

    fn tick(&mut self) {}
}

/// Maps handler errors to a retry decision
pub trait ErrorClassifier: Send {
    fn classify(&self, error: &CommonError) -> Classification;

    /// Decide what happens after attempt number `attempt` failed
    ///
    /// A job or step retry policy overrides the classification's retry count
    /// and backoff, but never makes a terminal error retryable.
    fn next_action(
        &self,
        error: &CommonError,
        attempt: u32,
        policy: Option<&RetryPolicy>,
    ) -> NextAction {
        let mut classification = self.classify(error);
        if let Some(policy) = policy {
            classification = classification.with_policy(policy);
        }
        classification.next_action(attempt)
    }

    fn trips_circuit(&self, error: &CommonError) -> bool {
        self.classify(error).trips_circuit
    }

    fn tick(&mut self) {}
}
