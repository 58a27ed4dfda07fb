//! Hooks around every step and job handler call

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::handler::{StepContext, StepFailure, StepResult};

#[async_trait]
pub trait StepMiddleware: Send + Sync {
    async fn before(&self, _ctx: &StepContext) {}

    async fn after(&self, _ctx: &StepContext, _result: &StepResult, _elapsed: Duration) {}
}

/// Structured log line per call
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl StepMiddleware for TracingMiddleware {
    async fn before(&self, ctx: &StepContext) {
        info!(
            execution_id = %ctx.execution_id,
            workflow = ctx.workflow.as_deref().unwrap_or("-"),
            step = %ctx.name,
            attempt = ctx.attempt,
            "step.started"
        );
    }

    async fn after(&self, ctx: &StepContext, result: &StepResult, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Ok(_) => info!(
                execution_id = %ctx.execution_id,
                step = %ctx.name,
                attempt = ctx.attempt,
                elapsed_ms,
                "step.completed"
            ),
            Err(StepFailure::Halt(reason)) => info!(
                execution_id = %ctx.execution_id,
                step = %ctx.name,
                reason = %reason,
                elapsed_ms,
                "step.halted"
            ),
            Err(StepFailure::Error(err)) => warn!(
                execution_id = %ctx.execution_id,
                step = %ctx.name,
                attempt = ctx.attempt,
                error = %err,
                error_type = err.error_type_name(),
                elapsed_ms,
                "step.failed"
            ),
        }
    }
}
