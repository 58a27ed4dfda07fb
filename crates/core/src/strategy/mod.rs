//! Resilience strategies applied around every job and step execution
//!
//! - [`CircuitBreakerStrategy`]: named circuits guarding upstreams
//! - [`RateLimiterStrategy`]: token buckets per scope and key
//! - [`ErrorClassifier`]: maps errors to retry, dead-letter or discard
//!
//! [`StrategyRunner`] serializes access to all three from one task.

pub mod circuit;
pub mod classifier;
pub mod error;
pub mod ports;
pub mod rate_limit;
pub mod runner;

pub use circuit::CircuitRegistry;
pub use classifier::{Classification, DefaultClassifier, ErrorClass, NextAction};
pub use error::{StrategyError, StrategyResult};
pub use ports::{CallOutcome, CircuitBreakerStrategy, ErrorClassifier, RateLimiterStrategy};
pub use rate_limit::TokenBucketLimiter;
pub use runner::{Strategies, StrategyRunner};
