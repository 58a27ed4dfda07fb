//! Job scheduling logic
//!
//! [`JobScheduler`] does the work of one scheduling pass: find due jobs, claim
//! each scheduled instance exactly once across nodes, gate it through the
//! strategy runner and run it. It owns no timers; the runtime service in
//! `cadence-infra` calls [`JobScheduler::tick`] on its poll interval and the
//! sweeper calls [`JobScheduler::rescue_stuck`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Clock, CommonError};
use cadence_domain::constants::DEFAULT_QUEUE;
use cadence_domain::{
    Execution, ExecutionStatus, Job, JobRef, JobState, RetryPolicy, Schedule, SchedulerConfig,
    Trigger, WorkflowDef,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::{SchedulerError, SchedulerResult};
use super::schedule::ScheduleCalculator;
use crate::store::{claim_lock_key, unique_lock_key, Store, StoreError};
use crate::strategy::{NextAction, StrategyError, StrategyRunner};
use crate::workflow::{HandlerRegistry, RunOutcome, StepContext, StepFailure, WorkflowEngine};

/// A scheduled instance this node won and must now execute
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub execution: Execution,
}

/// What happened to one due job during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ClaimedJob),
    /// Rate limited; due again at the given instant
    Deferred(DateTime<Utc>),
    /// Circuit open; moved to its next regular run
    Skipped,
    /// Another node or execution holds the instance
    Contended,
}

/// Summary of one scheduling pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub claimed: Vec<ClaimedJob>,
    pub deferred: Vec<String>,
    pub skipped: Vec<String>,
    /// Jobs whose claim failed; the rest of the pass went on without them
    pub failed: Vec<String>,
    pub contended: usize,
}

/// Claims and executes scheduled jobs against a shared store
#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn Store>,
    strategy: StrategyRunner,
    registry: Arc<HandlerRegistry>,
    engine: Option<WorkflowEngine>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    calculator: ScheduleCalculator,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        strategy: StrategyRunner,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            strategy,
            registry,
            engine: None,
            config,
            clock,
            calculator: ScheduleCalculator::default(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run jobs that target workflows through `engine`
    pub fn with_engine(mut self, engine: WorkflowEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate a job, compute its first run and store it
    #[instrument(skip(self, job), fields(job = %job.name))]
    pub async fn register(&self, mut job: Job) -> SchedulerResult<Job> {
        if job.name.trim().is_empty() {
            return Err(SchedulerError::invalid(&job.name, "name must not be empty"));
        }
        if job.queue.trim().is_empty() {
            job.queue = DEFAULT_QUEUE.to_string();
        }
        self.calculator.validate(&job.name, &job.schedule)?;

        let now = self.clock.utc_now();
        job.next_run_at = self.calculator.first_run(&job.schedule, now)?;
        job.state = JobState::Idle;
        job.created_at = now;
        job.updated_at = now;
        self.store.register_job(&job).await?;

        info!(
            job = %job.name,
            queue = %job.queue,
            next_run_at = ?job.next_run_at,
            "job.registered"
        );
        Ok(job)
    }

    /// Schedule a workflow whose trigger is a cron expression or an interval
    ///
    /// Returns `None` for manual and event triggers.
    pub async fn register_workflow_trigger(
        &self,
        def: &WorkflowDef,
    ) -> SchedulerResult<Option<Job>> {
        let schedule = match &def.trigger {
            Trigger::Cron { expression, timezone } => {
                Schedule::cron_in(expression.clone(), timezone.clone())
            }
            Trigger::Interval { every_ms } => Schedule::Interval { every_ms: *every_ms },
            Trigger::Manual | Trigger::Event { .. } => return Ok(None),
        };
        let job = Job::new(format!("workflow:{}", def.name), schedule)
            .with_target(JobRef::workflow(def.name.clone()))
            .unique();
        self.register(job).await.map(Some)
    }

    pub async fn unregister(&self, name: &str) -> SchedulerResult<bool> {
        let removed = self.store.delete_job(name).await?;
        if removed {
            info!(job = %name, "job.unregistered");
        }
        Ok(removed)
    }

    /// Make a job due immediately
    pub async fn run_now(&self, name: &str) -> SchedulerResult<Job> {
        let mut job = self.load_job(name).await?;
        let now = self.clock.utc_now();
        job.next_run_at = Some(now);
        job.updated_at = now;
        self.store.update_job(&job).await?;
        Ok(job)
    }

    /// Make every `@reboot` job due; call once at process start
    pub async fn on_boot(&self) -> SchedulerResult<usize> {
        let now = self.clock.utc_now();
        let mut booted = 0;
        for mut job in self.store.list_jobs(None).await? {
            if !job.schedule.is_reboot() || job.is_active() {
                continue;
            }
            job.next_run_at = Some(now);
            job.updated_at = now;
            self.store.update_job(&job).await?;
            booted += 1;
        }
        debug!(count = booted, "scheduler.boot_jobs_queued");
        Ok(booted)
    }

    /// Claim every due job on this node's queues
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let now = self.clock.utc_now();
        let mut report = TickReport::default();

        for queue in &self.config.queues {
            let limit = self.config.batch_limit;
            let due = match self.store.get_due_jobs(now, Some(queue.as_str()), limit).await {
                Ok(due) => due,
                Err(err) if report.claimed.is_empty() => return Err(err.into()),
                Err(err) => {
                    warn!(queue = %queue, error = %err, "scheduler.due_jobs_failed");
                    continue;
                }
            };
            for job in due {
                let name = job.name.clone();
                match self.claim(job, now).await {
                    Ok(ClaimOutcome::Claimed(claimed)) => report.claimed.push(claimed),
                    Ok(ClaimOutcome::Deferred(_)) => report.deferred.push(name),
                    Ok(ClaimOutcome::Skipped) => report.skipped.push(name),
                    Ok(ClaimOutcome::Contended) => report.contended += 1,
                    Err(err) => {
                        warn!(job = %name, error = %err, "job.claim_failed");
                        report.failed.push(name);
                    }
                }
            }
        }

        if !report.claimed.is_empty() || !report.failed.is_empty() {
            debug!(
                claimed = report.claimed.len(),
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                contended = report.contended,
                "scheduler.tick"
            );
        }
        Ok(report)
    }

    /// Try to take one due instance of `job` for this node
    pub async fn claim(&self, mut job: Job, now: DateTime<Utc>) -> SchedulerResult<ClaimOutcome> {
        let Some(scheduled) = job.next_run_at else {
            return Ok(ClaimOutcome::Contended);
        };
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        let claim_key = claim_lock_key(&job.name, scheduled.timestamp_millis());
        if !self.try_lock(&claim_key, &self.config.node_id, ttl).await? {
            return Ok(ClaimOutcome::Contended);
        }

        let execution = Execution::start(&job.name, &self.config.node_id, job.attempt + 1, now);
        let owner = execution.id.to_string();
        if job.unique && !self.try_lock(&unique_lock_key(&job.name), &owner, ttl).await? {
            debug!(job = %job.name, "job.unique_lock_held");
            return Ok(ClaimOutcome::Contended);
        }

        let scope = job.rate_limit_scope.clone();
        let gate =
            self.strategy.pre_execute_check(job.circuit_name(), scope.as_deref(), &job.name).await;
        if let Err(err) = gate {
            self.unlock_unique(&job, &owner).await;
            return self.defer(job, scheduled, now, err).await;
        }

        let next_run_at = match self.calculator.next_run(&job.schedule, Some(scheduled), now) {
            Ok(next) => next,
            Err(err) => {
                self.unlock_unique(&job, &owner).await;
                self.park(job, now, &err.to_string()).await;
                return Err(err.into());
            }
        };
        job = match self.store.mark_running(&job.name, &execution, next_run_at).await {
            Ok(job) => job,
            Err(err) => {
                self.unlock_unique(&job, &owner).await;
                return Err(err.into());
            }
        };
        info!(
            job = %job.name,
            execution_id = %execution.id,
            attempt = execution.attempt,
            "job.claimed"
        );
        Ok(ClaimOutcome::Claimed(ClaimedJob { job, execution }))
    }

    async fn defer(
        &self,
        mut job: Job,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
        err: StrategyError,
    ) -> SchedulerResult<ClaimOutcome> {
        let outcome = match &err {
            StrategyError::RateLimited { retry_after, .. } => {
                let at = now + chrono::Duration::from_std(*retry_after).unwrap_or_default();
                job.next_run_at = Some(at);
                ClaimOutcome::Deferred(at)
            }
            StrategyError::CircuitOpen { .. } => {
                job.next_run_at = self.calculator.next_run(&job.schedule, Some(scheduled), now)?;
                ClaimOutcome::Skipped
            }
            _ => return Err(err.into()),
        };
        job.updated_at = now;
        self.store.update_job(&job).await?;
        info!(job = %job.name, next_run_at = ?job.next_run_at, reason = %err, "job.deferred");
        Ok(outcome)
    }

    /// Take a job with no computable next run off the schedule
    async fn park(&self, mut job: Job, now: DateTime<Utc>, reason: &str) {
        job.next_run_at = None;
        job.last_error = Some(reason.to_string());
        job.updated_at = now;
        match self.store.update_job(&job).await {
            Ok(()) => warn!(job = %job.name, reason = %reason, "job.unschedulable"),
            Err(err) => warn!(job = %job.name, error = %err, "job.park_failed"),
        }
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> SchedulerResult<bool> {
        match self.store.acquire_unique_lock(key, owner, ttl).await {
            Ok(()) => Ok(true),
            Err(StoreError::LockConflict { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn unlock_unique(&self, job: &Job, owner: &str) {
        if !job.unique {
            return;
        }
        if let Err(err) = self.store.release_unique_lock(&unique_lock_key(&job.name), owner).await {
            warn!(job = %job.name, error = %err, "job.unlock_failed");
        }
    }

    /// Run a claimed instance to its end and record the outcome
    ///
    /// Heartbeats are written while the handler runs. A failed run is
    /// retried through the classifier: while retries remain the job is due
    /// again after the backoff delay, otherwise it waits for its regular run.
    /// The unique lock is released whether or not the outcome could be
    /// recorded.
    #[instrument(
        skip(self, claimed),
        fields(job = %claimed.job.name, execution_id = %claimed.execution.id)
    )]
    pub async fn execute(&self, claimed: ClaimedJob) -> SchedulerResult<Execution> {
        let ClaimedJob { job, mut execution } = claimed;
        let token = CancellationToken::new();
        self.running.lock().insert(job.name.clone(), token.clone());

        let mut ctx = StepContext::for_job(&job, &execution);
        ctx.cancellation = token.clone();
        let result = self.run_with_heartbeats(&job, ctx).await;
        self.running.lock().remove(&job.name);

        let now = self.clock.utc_now();
        let owner = execution.id.to_string();
        let cancelled = token.is_cancelled();
        let recorded = self.record_outcome(&job, &mut execution, result, cancelled, now).await;
        self.unlock_unique(&job, &owner).await;
        recorded?;
        Ok(execution)
    }

    async fn record_outcome(
        &self,
        job: &Job,
        execution: &mut Execution,
        result: Result<Value, StepFailure>,
        cancelled: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        match result {
            Ok(output) => {
                execution.complete(now, Some(output));
                self.store.mark_completed(&job.name, execution).await?;
                info!(job = %job.name, duration_ms = ?execution.duration_ms, "job.completed");
            }
            Err(StepFailure::Halt(reason)) => {
                let error = Some(format!("halted: {reason}"));
                execution.finish(ExecutionStatus::Cancelled, now, None, error);
                self.store.mark_cancelled(&job.name, Some(execution)).await?;
                info!(job = %job.name, reason = %reason, "job.halted");
            }
            Err(StepFailure::Error(err)) if cancelled => {
                execution.finish(ExecutionStatus::Cancelled, now, None, Some(err.to_string()));
                self.store.mark_cancelled(&job.name, Some(execution)).await?;
                info!(job = %job.name, "job.cancelled");
            }
            Err(StepFailure::Error(err)) => {
                execution.fail(now, err.to_string());
                let policy = RetryPolicy { max_retries: job.max_retries, backoff: job.backoff };
                let decided =
                    self.strategy.next_action(&err, execution.attempt, Some(policy)).await;
                let action = match decided {
                    Ok(action) => action,
                    Err(strategy_err) => {
                        warn!(job = %job.name, error = %strategy_err, "job.next_action_failed");
                        NextAction::DeadLetter
                    }
                };
                let retry_at = match action {
                    NextAction::Retry { delay } => {
                        Some(now + chrono::Duration::from_std(delay).unwrap_or_default())
                    }
                    NextAction::DeadLetter | NextAction::Discard => None,
                };
                self.store.mark_failed(&job.name, execution, retry_at).await?;
                warn!(
                    job = %job.name,
                    attempt = execution.attempt,
                    retry_at = ?retry_at,
                    error = %err,
                    "job.failed"
                );
            }
        }
        Ok(())
    }

    /// Claim-then-execute for every due job, sequentially; used by tests and
    /// single-node embedding
    pub async fn run_pending(&self) -> SchedulerResult<Vec<Execution>> {
        let report = self.tick().await?;
        let mut executions = Vec::with_capacity(report.claimed.len());
        for claimed in report.claimed {
            let name = claimed.job.name.clone();
            match self.execute(claimed).await {
                Ok(execution) => executions.push(execution),
                Err(err) => warn!(job = %name, error = %err, "job.execute_failed"),
            }
        }
        Ok(executions)
    }

    async fn run_with_heartbeats(&self, job: &Job, ctx: StepContext) -> Result<Value, StepFailure> {
        let work = self.invoke(job, ctx);
        tokio::pin!(work);

        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let mut beats = tokio::time::interval(period);
        beats.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = beats.tick() => {
                    if let Err(err) = self.heartbeat(&job.name).await {
                        warn!(job = %job.name, error = %err, "job.heartbeat_failed");
                    }
                }
            }
        }
    }

    async fn invoke(&self, job: &Job, ctx: StepContext) -> Result<Value, StepFailure> {
        let cancellation = ctx.cancellation.clone();
        let call = async {
            match job.timeout_ms {
                Some(ms) => {
                    let limit = Duration::from_millis(ms);
                    tokio::time::timeout(limit, self.dispatch(job, ctx))
                        .await
                        .unwrap_or_else(|_| {
                            Err(CommonError::timeout(job.name.clone(), limit).into())
                        })
                }
                None => self.dispatch(job, ctx).await,
            }
        };

        let result = tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                let reason = "job cancelled";
                Err(CommonError::task_cancelled_with_reason(job.name.clone(), reason).into())
            }
            result = call => result,
        };

        let recorded = match &result {
            Err(StepFailure::Error(err)) => {
                self.strategy.record_result(job.circuit_name(), Err(err)).await
            }
            _ => self.strategy.record_result(job.circuit_name(), Ok(())).await,
        };
        if let Err(err) = recorded {
            warn!(job = %job.name, error = %err, "job.record_result_failed");
        }
        result
    }

    async fn dispatch(&self, job: &Job, mut ctx: StepContext) -> Result<Value, StepFailure> {
        let key = match &job.target {
            JobRef::Workflow { name } => return self.dispatch_workflow(name, ctx.input).await,
            JobRef::Call { module, function, args } => {
                ctx.args = Some(args.clone());
                format!("{module}.{function}")
            }
            JobRef::Local { name } => name.clone(),
            JobRef::Remote { module, function } => format!("{module}.{function}"),
        };
        match self.registry.handler(&key) {
            Some(handler) => handler.call(ctx).await,
            None => Err(CommonError::config(format!("no handler registered for '{key}'")).into()),
        }
    }

    async fn dispatch_workflow(&self, name: &str, input: Value) -> Result<Value, StepFailure> {
        let Some(engine) = &self.engine else {
            return Err(CommonError::config(format!("no workflow engine to run '{name}'")).into());
        };
        match engine.start(name, input).await {
            Ok(RunOutcome::Completed { execution_id, outputs }) => {
                Ok(json!({ "execution_id": execution_id, "outputs": outputs }))
            }
            Ok(RunOutcome::Checkpoint { execution_id, step }) => {
                Ok(json!({ "execution_id": execution_id, "checkpoint": step }))
            }
            Ok(RunOutcome::Halted { reason, .. }) => Err(StepFailure::Halt(reason)),
            Ok(RunOutcome::Cancelled { .. }) => {
                Err(CommonError::task_cancelled_with_reason(name, "workflow cancelled").into())
            }
            Ok(RunOutcome::Failed { error, .. }) => {
                Err(CommonError::internal_with_context(error, format!("workflow '{name}'")).into())
            }
            Err(err) => {
                let context = format!("workflow '{name}'");
                Err(CommonError::internal_with_context(err.to_string(), context).into())
            }
        }
    }

    /// Cancel a job's in-flight execution on this node
    ///
    /// Returns `false` when the job is not running here.
    pub fn cancel(&self, name: &str) -> bool {
        let token = self.running.lock().get(name).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn heartbeat(&self, job: &str) -> SchedulerResult<()> {
        let now = self.clock.utc_now();
        self.store.record_heartbeat(job, &self.config.node_id, now).await?;
        Ok(())
    }

    /// Release executions whose heartbeat went silent so their jobs can run
    /// again
    #[instrument(skip(self))]
    pub async fn rescue_stuck(&self) -> SchedulerResult<Vec<Execution>> {
        let now = self.clock.utc_now();
        let cutoff = now - chrono::Duration::milliseconds(self.config.stuck_cutoff_ms as i64);
        let mut rescued = Vec::new();
        for stuck in self.store.get_stuck_executions(cutoff).await? {
            match self.store.mark_execution_rescued(stuck.id, now).await {
                Ok(execution) => {
                    warn!(
                        job = %execution.job_name,
                        execution_id = %execution.id,
                        node = %execution.node,
                        "job.rescued"
                    );
                    rescued.push(execution);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(rescued)
    }

    /// Drop finished executions older than `max_age`
    pub async fn prune_history(&self, max_age: Duration, limit: usize) -> SchedulerResult<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_default();
        let before = self.clock.utc_now() - max_age;
        Ok(self.store.prune_executions(before, limit).await?)
    }

    async fn load_job(&self, name: &str) -> SchedulerResult<Job> {
        self.store
            .get_job(name)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))
    }
}
