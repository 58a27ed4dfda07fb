//! Domain types and models

pub mod events;
pub mod execution;
pub mod job;
pub mod run;
pub mod workflow;

pub use events::JobEvent;
pub use execution::{Execution, ExecutionStatus};
pub use job::{BackoffKind, BackoffPolicy, Job, JobState, Schedule};
pub use run::{DeadLetter, RunStatus, StepRecord, StepStatus, WorkflowRun};
pub use workflow::{JobRef, OnError, RetryPolicy, StepDef, Trigger, WorkflowDef};
