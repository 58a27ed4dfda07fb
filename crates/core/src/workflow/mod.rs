//! Workflow composition and execution
//!
//! A workflow is a DAG of steps built with [`WorkflowBuilder`], checked by
//! [`graph::validate`] and run by [`WorkflowEngine`]. Step code is looked up
//! in a [`HandlerRegistry`] by the step's job reference.

pub mod builder;
pub mod engine;
pub mod error;
pub mod graph;
pub mod handler;
pub mod middleware;

pub use builder::WorkflowBuilder;
pub use engine::{RunOutcome, WorkflowEngine, MAX_NESTING_DEPTH};
pub use error::{WorkflowError, WorkflowResult};
pub use graph::{validate, StepDeps};
pub use handler::{
    FnHandler, HandlerRegistry, Predicate, StepContext, StepFailure, StepHandler, StepResult,
};
pub use middleware::{StepMiddleware, TracingMiddleware};
