//! Resilience primitives
//!
//! - **Circuit Breaker**: stops calling a failing dependency until it has had
//!   time to recover
//! - **Token Bucket**: admits bursts up to a capacity, then a steady refill
//!   rate
//! - **Backoff**: delay calculation for retries, with optional jitter
//!
//! These are single-owner state machines taking `&mut self` and a
//! [`Clock`](crate::time::Clock). Sharing one across tasks is the caller's
//! concern; the strategy runner in `cadence-core` owns all of them inside one
//! actor so no per-breaker locking is needed.

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use backoff::{BackoffStrategy, Jitter};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitSnapshot,
    CircuitState, ConfigError, ConfigResult,
};
pub use rate_limiter::{TokenBucket, TokenBucketConfig};
