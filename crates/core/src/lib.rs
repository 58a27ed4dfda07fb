//! # Cadence Core
//!
//! Scheduling and workflow orchestration logic - no infrastructure
//! dependencies.
//!
//! This crate contains:
//! - The persistence contract (`store`) every backend implements
//! - The strategy runner: circuit breakers, rate limits, error classification
//! - Workflow building, validation and execution
//! - The job scheduler's claim/execute/rescue logic
//!
//! ## Architecture Principles
//! - Depends on `cadence-common` and `cadence-domain` only
//! - No database, network or platform code
//! - All external dependencies via traits
//! - Time comes from an injected `Clock`

pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod workflow;

pub use scheduler::{JobScheduler, SchedulerError, SchedulerResult, TickReport};
pub use store::{
    ExecutionStore, JobStore, LockStore, Store, StoreError, StoreResult, WorkflowStore,
};
pub use strategy::{
    CircuitBreakerStrategy, ErrorClassifier, NextAction, RateLimiterStrategy, StrategyError,
    StrategyRunner,
};
pub use workflow::{
    HandlerRegistry, RunOutcome, StepContext, StepFailure, StepHandler, WorkflowBuilder,
    WorkflowEngine, WorkflowError,
};
