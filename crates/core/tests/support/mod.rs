//! Shared test helpers for `cadence-core` integration tests.
//!
//! An in-memory store and small builders so scenarios can focus on
//! scheduling and workflow behaviour instead of wiring.

#![allow(dead_code)]

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use cadence_common::MockClock;
use cadence_core::strategy::StrategyRunner;
use cadence_core::workflow::{HandlerRegistry, WorkflowEngine};
use cadence_domain::{BackoffPolicy, RetryPolicy, StrategyConfig, WorkflowConfig};
use chrono::{TimeZone, Utc};

pub use store::MemoryStore;

/// Mock clock starting at a fixed, minute-aligned instant
pub fn clock() -> MockClock {
    MockClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 3, 10, 7, 0).unwrap())
}

/// Retries without waiting
pub fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy { max_retries, backoff: BackoffPolicy::immediate() }
}

pub fn strategy(config: &StrategyConfig, clock: &MockClock) -> StrategyRunner {
    StrategyRunner::from_config(config, clock.clone()).unwrap()
}

/// Engine over a fresh store, default strategies and `registry`
pub fn engine(registry: HandlerRegistry) -> (WorkflowEngine, MemoryStore) {
    engine_with(registry, &StrategyConfig::default(), WorkflowConfig::default())
}

pub fn engine_with(
    registry: HandlerRegistry,
    strategy_config: &StrategyConfig,
    config: WorkflowConfig,
) -> (WorkflowEngine, MemoryStore) {
    let clock = clock();
    let store = MemoryStore::new(clock.clone());
    let engine = WorkflowEngine::new(
        Arc::new(store.clone()),
        strategy(strategy_config, &clock),
        Arc::new(registry),
        config,
        Arc::new(clock),
    );
    (engine, store)
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
