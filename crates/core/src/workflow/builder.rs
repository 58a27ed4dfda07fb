//! Fluent construction of workflow definitions

use std::collections::HashMap;
use std::time::Duration;

use cadence_domain::{RetryPolicy, StepDef, Trigger, WorkflowDef};

use super::error::WorkflowResult;
use super::graph;

/// Builds and validates a [`WorkflowDef`]
///
/// ```
/// use cadence_core::workflow::WorkflowBuilder;
/// use cadence_domain::{JobRef, StepDef};
///
/// let def = WorkflowBuilder::new("signup")
///     .step(StepDef::new("create", JobRef::local("accounts.create")))
///     .step(StepDef::new("welcome", JobRef::local("mail.welcome")).depends_on(["create"]))
///     .build()
///     .unwrap();
/// assert_eq!(def.steps.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    def: WorkflowDef,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { def: WorkflowDef::new(name) }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.def.version = version;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.def.trigger = trigger;
        self
    }

    /// Fail the whole run if it takes longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.def.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Retry policy for steps without their own
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.def.retry = retry;
        self
    }

    /// Record exhausted failures that were not compensated
    pub fn dead_letter(mut self) -> Self {
        self.def.dead_letter = true;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.def.max_concurrency = Some(max.max(1));
        self
    }

    pub fn step(mut self, step: StepDef) -> Self {
        self.def.steps.push(step);
        self
    }

    /// Name a set of steps so others can depend on all of them at once
    pub fn group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.def
            .groups
            .entry(name.into())
            .or_default()
            .extend(members.into_iter().map(Into::into));
        self
    }

    /// Declare a join point that steps can be attached to later
    pub fn graft(mut self, name: impl Into<String>) -> Self {
        self.def.grafts.entry(name.into()).or_default();
        self
    }

    /// Add `step` and attach it to `graft`, declaring the graft if needed
    pub fn attach(mut self, graft: impl Into<String>, step: StepDef) -> Self {
        self.def.grafts.entry(graft.into()).or_default().push(step.name.clone());
        self.def.steps.push(step);
        self
    }

    /// Embed another workflow's steps under `prefix` (default: its name)
    ///
    /// Embedded step, group and graft names become `prefix.name`, and
    /// references inside the embedded workflow are rewritten to match. The
    /// prefix itself becomes a group of all embedded steps, so the rest of
    /// this workflow can depend on the embedded one as a whole.
    pub fn add_workflow(mut self, child: &WorkflowDef, prefix: Option<&str>) -> Self {
        let prefix = prefix.unwrap_or(&child.name).to_string();
        let scoped = |name: &str| format!("{prefix}.{name}");

        let mut renames: HashMap<&str, String> = HashMap::new();
        for name in child
            .steps
            .iter()
            .map(|s| s.name.as_str())
            .chain(child.groups.keys().map(String::as_str))
            .chain(child.grafts.keys().map(String::as_str))
        {
            renames.insert(name, scoped(name));
        }
        let rename =
            |name: &String| renames.get(name.as_str()).cloned().unwrap_or_else(|| name.clone());

        let mut members = Vec::with_capacity(child.steps.len());
        for step in &child.steps {
            let mut step = step.clone();
            step.name = rename(&step.name);
            step.depends_on = step.depends_on.iter().map(rename).collect();
            step.depends_on_any = step.depends_on_any.iter().map(rename).collect();
            members.push(step.name.clone());
            self.def.steps.push(step);
        }
        for (name, group) in &child.groups {
            self.def.groups.insert(scoped(name), group.iter().map(rename).collect());
        }
        for (name, graft) in &child.grafts {
            self.def.grafts.insert(scoped(name), graft.iter().map(rename).collect());
        }

        self.def.groups.insert(prefix, members);
        self.def.embedded.push(child.name.clone());
        self
    }

    /// Validate and return the definition
    pub fn build(self) -> WorkflowResult<WorkflowDef> {
        graph::validate(&self.def)?;
        Ok(self.def)
    }

    /// Return the definition without validating it
    pub fn build_unchecked(self) -> WorkflowDef {
        self.def
    }
}
