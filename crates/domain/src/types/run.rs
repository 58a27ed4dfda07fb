//! Workflow execution state
//!
//! A [`WorkflowRun`] is everything needed to resume an execution: it is what
//! gets checkpointed when a step awaits approval.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::impl_domain_status_conversions;

/// Per-step state: `pending → running → {completed | failed | skipped |
/// cancelled}`, `failed → running` on retry, `running → awaiting → running`
/// around an approval checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Awaiting,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl_domain_status_conversions!(StepStatus {
    Pending => "pending",
    Running => "running",
    Awaiting => "awaiting",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
    Cancelled => "cancelled",
});

impl StepStatus {
    /// Whether the step will not run (again) in this execution
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }

    /// Whether dependents may proceed
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Progress of one step inside a run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Attempts started, including retries
    pub attempts: u32,
    /// Times the step was postponed by an open circuit or a rate limit
    pub deferrals: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rolled_back: bool,
}

/// Overall state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    /// Paused at an approval checkpoint
    Awaiting,
    Completed,
    Failed,
    Halted,
    Cancelled,
}

impl_domain_status_conversions!(RunStatus {
    Running => "running",
    Awaiting => "awaiting",
    Completed => "completed",
    Failed => "failed",
    Halted => "halted",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Halted | Self::Cancelled)
    }
}

/// Resumable state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow: String,
    pub version: u32,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub steps: BTreeMap<String, StepRecord>,
    /// Steps in the order they completed; rollback walks it backwards
    #[serde(default)]
    pub completion_order: Vec<String>,
    /// Step currently awaiting approval
    pub checkpoint: Option<String>,
    /// Execution that invoked this one as a nested workflow
    pub parent: Option<Uuid>,
    pub error: Option<String>,
    /// Steps whose rollback ran, in execution order
    #[serde(default)]
    pub rolled_back: Vec<String>,
    /// Time spent executing, excluding waits at approval checkpoints
    #[serde(default)]
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Fresh run with every listed step pending
    pub fn new<'a, I>(workflow: &str, version: u32, input: serde_json::Value, steps: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow: workflow.to_string(),
            version,
            status: RunStatus::Running,
            input,
            steps: steps.into_iter().map(|s| (s.to_string(), StepRecord::default())).collect(),
            completion_order: Vec::new(),
            checkpoint: None,
            parent: None,
            error: None,
            rolled_back: Vec::new(),
            elapsed_ms: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn step_status(&self, step: &str) -> Option<StepStatus> {
        self.steps.get(step).map(|r| r.status)
    }

    /// Outputs of completed steps, keyed by step name
    pub fn outputs(&self) -> BTreeMap<String, serde_json::Value> {
        self.steps
            .iter()
            .filter_map(|(name, rec)| rec.output.clone().map(|out| (name.clone(), out)))
            .collect()
    }
}

/// A failed execution kept for manual inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow: String,
    pub step: Option<String>,
    pub error: String,
    pub attempts: u32,
    pub input: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
