//! Step handlers and the registry that resolves job references to them

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_common::CommonError;
use cadence_domain::{Execution, Job};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a handler gets to see about the call it serves
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Workflow run or job execution id
    pub execution_id: Uuid,
    /// Owning workflow; `None` for scheduled jobs
    pub workflow: Option<String>,
    /// Step name, or job name for scheduled jobs
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub input: Value,
    /// Fixed arguments from a `call` reference
    pub args: Option<Value>,
    /// Outputs of the steps that completed before this one
    pub outputs: BTreeMap<String, Value>,
    /// Fires when the run is cancelled and this call may be interrupted
    pub cancellation: CancellationToken,
}

impl StepContext {
    /// Context for one execution of a scheduled job; `input` carries the
    /// job's metadata
    pub fn for_job(job: &Job, execution: &Execution) -> Self {
        let input = job
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        Self {
            execution_id: execution.id,
            workflow: None,
            name: job.name.clone(),
            attempt: execution.attempt,
            input: Value::Object(input),
            args: None,
            outputs: BTreeMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Why a handler did not produce a value
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// Ordinary failure; the classifier decides whether to retry
    Error(CommonError),
    /// Stop the workflow without compensation
    Halt(String),
}

impl StepFailure {
    pub fn halt(reason: impl Into<String>) -> Self {
        Self::Halt(reason.into())
    }
}

impl From<CommonError> for StepFailure {
    fn from(err: CommonError) -> Self {
        Self::Error(err)
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err}"),
            Self::Halt(reason) => write!(f, "halted: {reason}"),
        }
    }
}

pub type StepResult = Result<Value, StepFailure>;

/// Code behind a job reference
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, ctx: StepContext) -> StepResult;
}

/// Adapter that lets an async closure act as a [`StepHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn call(&self, ctx: StepContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Named condition evaluated against the run input and completed outputs
pub type Predicate = Arc<dyn Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync>;

/// Maps handler keys (`name` or `module.function`) to handlers and condition
/// names to predicates
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    predicates: HashMap<String, Predicate>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under `key`
    pub fn register(
        &mut self,
        key: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(key.into(), Arc::new(handler));
        self
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, key: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        self.register(key, FnHandler(handler))
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F) -> &mut Self
    where
        F: Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    pub fn handler(&self, key: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn predicate(&self, name: &str) -> Option<Predicate> {
        self.predicates.get(name).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        let mut predicates: Vec<_> = self.predicates.keys().collect();
        predicates.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &handlers)
            .field("predicates", &predicates)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(input: Value) -> StepContext {
        StepContext {
            execution_id: Uuid::nil(),
            workflow: Some("wf".into()),
            name: "step".into(),
            attempt: 1,
            input,
            args: None,
            outputs: BTreeMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_closure_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("billing.charge", |ctx: StepContext| async move {
            let amount = ctx.input["amount"].as_u64().unwrap_or(0);
            if amount == 0 {
                let invalid = CommonError::validation("amount", "must be positive");
                return Err(StepFailure::Error(invalid));
            }
            Ok(json!({"charged": amount}))
        });

        let handler = registry.handler("billing.charge").unwrap();
        assert_eq!(handler.call(ctx(json!({"amount": 5}))).await, Ok(json!({"charged": 5})));
        assert!(matches!(handler.call(ctx(json!({}))).await, Err(StepFailure::Error(_))));
        assert!(registry.handler("billing.refund").is_none());
    }

    #[test]
    fn test_predicates() {
        let mut registry = HandlerRegistry::new();
        registry.register_predicate("has_email", |input, _outputs| input.get("email").is_some());

        let predicate = registry.predicate("has_email").unwrap();
        assert!(predicate(&json!({"email": "a@b.c"}), &BTreeMap::new()));
        assert!(!predicate(&json!({}), &BTreeMap::new()));
        assert!(registry.has_predicate("has_email"));
    }

    #[test]
    fn test_job_context_carries_metadata() {
        let mut job = Job::new("export", cadence_domain::Schedule::cron("0 * * * *"));
        job.metadata.insert("bucket".into(), "reports".into());
        let exec = Execution::start("export", "node-1", 2, chrono::Utc::now());

        let ctx = StepContext::for_job(&job, &exec);
        assert_eq!(ctx.input, json!({"bucket": "reports"}));
        assert_eq!(ctx.attempt, 2);
        assert!(ctx.workflow.is_none());
        assert_eq!(StepFailure::halt("manual").to_string(), "halted: manual");
    }
}
