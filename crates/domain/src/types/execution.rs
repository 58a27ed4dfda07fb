//! Job execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::impl_domain_status_conversions;

/// Lifecycle of a single job run attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Presumed crashed (stale heartbeat) and released by the sweeper
    Rescued,
}

impl_domain_status_conversions!(ExecutionStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Rescued => "rescued",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One record per job run attempt (append-only history)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_name: String,
    /// Worker node that claimed the run
    pub node: String,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A freshly started execution; its first heartbeat is the start time
    pub fn start(
        job_name: impl Into<String>,
        node: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_name: job_name.into(),
            node: node.into(),
            attempt,
            status: ExecutionStatus::Running,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            heartbeat_at: Some(now),
        }
    }

    /// Close the record with a terminal status
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        now: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.result = result;
        self.error = error;
    }

    pub fn complete(&mut self, now: DateTime<Utc>, result: Option<serde_json::Value>) {
        self.finish(ExecutionStatus::Completed, now, result, None);
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.finish(ExecutionStatus::Failed, now, None, Some(error.into()));
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}
