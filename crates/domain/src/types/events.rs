//! Job state-change notifications
//!
//! Published by the store on every state transition for external observers
//! (dashboards, audit sinks).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobRegistered { job: String, at: DateTime<Utc> },
    JobStarted { job: String, execution_id: Uuid, node: String, at: DateTime<Utc> },
    JobCompleted { job: String, execution_id: Uuid, duration_ms: Option<u64>, at: DateTime<Utc> },
    JobFailed { job: String, execution_id: Uuid, error: String, at: DateTime<Utc> },
    JobCancelled { job: String, execution_id: Option<Uuid>, at: DateTime<Utc> },
    JobRescued { job: String, execution_id: Uuid, at: DateTime<Utc> },
    JobDeleted { job: String, at: DateTime<Utc> },
}

impl JobEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobRegistered { .. } => "job_registered",
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::JobRescued { .. } => "job_rescued",
            Self::JobDeleted { .. } => "job_deleted",
        }
    }

    pub fn job(&self) -> &str {
        match self {
            Self::JobRegistered { job, .. }
            | Self::JobStarted { job, .. }
            | Self::JobCompleted { job, .. }
            | Self::JobFailed { job, .. }
            | Self::JobCancelled { job, .. }
            | Self::JobRescued { job, .. }
            | Self::JobDeleted { job, .. } => job,
        }
    }
}
