//! Workflow and step definitions
//!
//! These are plain serializable values. Construction and validation (cycle
//! detection, dependency resolution) live in `cadence-core`'s workflow
//! builder; the engine only ever runs a definition that passed validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::job::BackoffPolicy;
use crate::constants::DEFAULT_MAX_RETRIES;
use crate::impl_domain_status_conversions;

/// What a step or job invokes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRef {
    /// Handler registered locally under `name`
    Local { name: String },
    /// Handler registered as `module.function`
    Remote { module: String, function: String },
    /// `module.function` invoked with fixed arguments
    Call { module: String, function: String, args: serde_json::Value },
    /// Run another registered workflow by name
    Workflow { name: String },
}

impl JobRef {
    pub fn local(name: impl Into<String>) -> Self {
        Self::Local { name: name.into() }
    }

    pub fn remote(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self::Remote { module: module.into(), function: function.into() }
    }

    pub fn call(
        module: impl Into<String>,
        function: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::Call { module: module.into(), function: function.into(), args }
    }

    pub fn workflow(name: impl Into<String>) -> Self {
        Self::Workflow { name: name.into() }
    }

    /// Registry key for handler-backed references
    pub fn handler_key(&self) -> Option<String> {
        match self {
            Self::Local { name } => Some(name.clone()),
            Self::Remote { module, function } | Self::Call { module, function, .. } => {
                Some(format!("{module}.{function}"))
            }
            Self::Workflow { .. } => None,
        }
    }
}

/// What to do when a step fails for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Roll back completed steps, not the failing one
    #[default]
    Rollback,
    /// Roll back completed steps and the failing step itself
    RollbackSelf,
    /// Stop without rollback; `ensure` steps still run
    Halt,
}

impl_domain_status_conversions!(OnError {
    Rollback => "rollback",
    RollbackSelf => "rollback_self",
    Halt => "halt",
});

/// Retry settings; a step without its own falls back to the workflow's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, backoff: BackoffPolicy::default() }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, backoff: BackoffPolicy::immediate() }
    }
}

/// One node of the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub job: JobRef,
    /// Every entry must be satisfied; entries name steps, groups or grafts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// At least one entry must be satisfied
    #[serde(default)]
    pub depends_on_any: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub rollback: Option<JobRef>,
    /// Named predicate; the step is skipped when it evaluates false
    pub condition: Option<String>,
    #[serde(default)]
    pub await_approval: bool,
    #[serde(default)]
    pub cancellable: bool,
    /// Cleanup step that runs after a halt, failure or cancellation
    #[serde(default)]
    pub ensure: bool,
    #[serde(default)]
    pub on_error: OnError,
    /// Circuit consulted before each attempt
    pub circuit: Option<String>,
    /// Rate-limit scope consulted before each attempt
    pub rate_limit_scope: Option<String>,
}

impl StepDef {
    pub fn new(name: impl Into<String>, job: JobRef) -> Self {
        Self {
            name: name.into(),
            job,
            depends_on: Vec::new(),
            depends_on_any: Vec::new(),
            timeout_ms: None,
            retry: None,
            rollback: None,
            condition: None,
            await_approval: false,
            cancellable: false,
            ensure: false,
            on_error: OnError::default(),
            circuit: None,
            rate_limit_scope: None,
        }
    }

    /// Require every named step, group or graft to finish first
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Require at least one of the named entries to finish first
    pub fn depends_on_any<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_any.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_rollback(mut self, rollback: JobRef) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Name of a registered predicate; the step is skipped when it is false
    pub fn when(mut self, predicate: impl Into<String>) -> Self {
        self.condition = Some(predicate.into());
        self
    }

    pub fn await_approval(mut self) -> Self {
        self.await_approval = true;
        self
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    /// Cleanup step that runs after the workflow settles, whatever the outcome
    pub fn ensure(mut self) -> Self {
        self.ensure = true;
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_circuit(mut self, circuit: impl Into<String>) -> Self {
        self.circuit = Some(circuit.into());
        self
    }

    pub fn with_rate_limit_scope(mut self, scope: impl Into<String>) -> Self {
        self.rate_limit_scope = Some(scope.into());
        self
    }
}

/// How a workflow gets started
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Cron { expression: String, timezone: String },
    Interval { every_ms: u64 },
    Event { name: String },
}

/// A named DAG of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    pub version: u32,
    /// Steps in declaration order
    pub steps: Vec<StepDef>,
    /// Group name → member steps; depending on a group waits for all members
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Graft name → attached steps; a join point that branches attach to
    /// after the dependent step was declared
    #[serde(default)]
    pub grafts: BTreeMap<String, Vec<String>>,
    /// Names of workflows embedded with a name prefix
    #[serde(default)]
    pub embedded: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dead_letter: bool,
    pub max_concurrency: Option<usize>,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            steps: Vec::new(),
            groups: BTreeMap::new(),
            grafts: BTreeMap::new(),
            embedded: Vec::new(),
            trigger: Trigger::Manual,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            dead_letter: false,
            max_concurrency: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Retry policy in effect for a step
    pub fn retry_for(&self, step: &StepDef) -> RetryPolicy {
        step.retry.unwrap_or(self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_keys() {
        assert_eq!(JobRef::local("send").handler_key().as_deref(), Some("send"));
        let remote = JobRef::remote("billing", "charge");
        assert_eq!(remote.handler_key().as_deref(), Some("billing.charge"));
        assert_eq!(
            JobRef::call("billing", "refund", serde_json::json!({"full": true}))
                .handler_key()
                .as_deref(),
            Some("billing.refund")
        );
        assert_eq!(JobRef::workflow("child").handler_key(), None);
    }

    #[test]
    fn test_job_ref_is_tagged() {
        let json = serde_json::to_value(JobRef::workflow("onboarding")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "workflow", "name": "onboarding"}));
    }

    #[test]
    fn test_retry_fallback() {
        let mut wf = WorkflowDef::new("wf");
        wf.retry = RetryPolicy { max_retries: 7, ..RetryPolicy::default() };
        let mut step = StepDef::new("a", JobRef::local("a"));
        assert_eq!(wf.retry_for(&step).max_retries, 7);

        step.retry = Some(RetryPolicy::none());
        assert_eq!(wf.retry_for(&step).max_retries, 0);
    }

    #[test]
    fn test_definition_round_trips_through_json() {
        let mut wf = WorkflowDef::new("orders");
        let mut step = StepDef::new("charge", JobRef::remote("billing", "charge"));
        step.rollback = Some(JobRef::remote("billing", "refund"));
        step.on_error = OnError::Halt;
        wf.steps.push(step);
        wf.groups.insert("notify".into(), vec!["email".into(), "sms".into()]);

        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
    }
}
