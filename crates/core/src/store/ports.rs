//! Port interfaces for persistence
//!
//! Backends implement the four focused traits; the scheduler and the workflow
//! engine depend on the [`Store`] umbrella. Every method that changes job
//! state publishes the matching [`JobEvent`] to subscribers.

use std::time::Duration;

use async_trait::async_trait;
use cadence_domain::{
    DeadLetter, Execution, Job, JobEvent, RunStatus, WorkflowDef, WorkflowRun,
};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::StoreResult;

/// Job definitions, due-job index and job state transitions
#[async_trait]
pub trait JobStore: Send + Sync {
    // Definitions
    /// Insert or replace a job definition and index it by `next_run_at`
    async fn register_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, name: &str) -> StoreResult<Option<Job>>;

    /// All jobs, optionally restricted to one queue, ordered by name
    async fn list_jobs(&self, queue: Option<&str>) -> StoreResult<Vec<Job>>;

    /// Overwrite an existing job; fails with `JobNotFound` if it is unknown
    async fn update_job(&self, job: &Job) -> StoreResult<()>;

    /// Delete a job and its history; returns whether it existed
    async fn delete_job(&self, name: &str) -> StoreResult<bool>;

    // Scheduling
    /// Idle jobs whose `next_run_at <= now`, lowest priority value first,
    /// then earliest `next_run_at`
    ///
    /// `None` reads every queue.
    async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        queue: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Job>>;

    /// Mark a job active, record the execution start and move the job to
    /// `next_run_at` (`None` removes it from the due index)
    async fn mark_running(
        &self,
        name: &str,
        execution: &Execution,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job>;

    /// Record a successful execution and return the job to idle
    async fn mark_completed(&self, name: &str, execution: &Execution) -> StoreResult<Job>;

    /// Record a failed execution and return the job to idle
    ///
    /// With `retry_at` the job is due again at that instant and its attempt
    /// counter advances; without it the attempt counter resets.
    async fn mark_failed(
        &self,
        name: &str,
        execution: &Execution,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job>;

    async fn mark_cancelled(&self, name: &str, execution: Option<&Execution>) -> StoreResult<Job>;

    /// Force-release the job's unique lock regardless of owner
    async fn release_lock(&self, name: &str) -> StoreResult<()>;

    /// Receive job state-change notifications
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// Expiring mutual-exclusion keys
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `owner` unless someone else holds an unexpired lock
    ///
    /// Re-acquiring a key you already own refreshes its TTL. Fails with
    /// `LockConflict` naming the current owner otherwise.
    async fn acquire_unique_lock(&self, key: &str, owner: &str, ttl: Duration)
        -> StoreResult<()>;

    /// Release `key` only if `owner` still holds it; returns whether it did
    async fn release_unique_lock(&self, key: &str, owner: &str) -> StoreResult<bool>;

    async fn lock_owner(&self, key: &str) -> StoreResult<Option<String>>;
}

/// Execution history and heartbeats
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Record a running execution and its first heartbeat
    async fn record_execution_start(&self, execution: &Execution) -> StoreResult<()>;

    /// Persist the final state of an execution and trim history
    async fn record_execution_complete(&self, execution: &Execution) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;

    /// Executions of one job, newest first
    async fn get_executions(
        &self,
        job: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<Execution>>;

    /// Delete finished executions that started before `before`; returns the count
    async fn prune_executions(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<usize>;

    /// Refresh the heartbeat of the job's running execution
    async fn record_heartbeat(&self, job: &str, node: &str, at: DateTime<Utc>)
        -> StoreResult<()>;

    /// Running executions whose last heartbeat is older than `cutoff`
    async fn get_stuck_executions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Execution>>;

    /// Mark a stuck execution rescued, release its job's lock and return the
    /// job to idle
    async fn mark_execution_rescued(&self, id: Uuid, at: DateTime<Utc>)
        -> StoreResult<Execution>;
}

/// Workflow definitions, run checkpoints and dead letters
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn register_workflow(&self, def: &WorkflowDef) -> StoreResult<()>;

    async fn get_workflow(&self, name: &str) -> StoreResult<Option<WorkflowDef>>;

    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowDef>>;

    async fn delete_workflow(&self, name: &str) -> StoreResult<bool>;

    /// Persist a run checkpoint, replacing any earlier one
    async fn save_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    async fn load_run(&self, id: Uuid) -> StoreResult<Option<WorkflowRun>>;

    async fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<WorkflowRun>>;

    async fn delete_run(&self, id: Uuid) -> StoreResult<bool>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> StoreResult<()>;

    /// Dead letters, newest first, optionally for one workflow
    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetter>>;
}

/// Everything the scheduler and the workflow engine persist
pub trait Store: JobStore + LockStore + ExecutionStore + WorkflowStore {}

impl<T> Store for T where T: JobStore + LockStore + ExecutionStore + WorkflowStore {}
