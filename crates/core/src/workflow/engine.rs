//! Workflow execution engine
//!
//! Runs a validated definition as a DAG: every step whose dependencies are
//! satisfied starts, up to the concurrency limit. Each attempt passes the
//! strategy gate (circuit, rate limit) first; a refused attempt is deferred
//! and does not count as a failure. Failed attempts are retried per the
//! classifier. A final failure compensates completed steps in reverse
//! completion order, then `ensure` steps run whatever the outcome.
//!
//! The run is checkpointed to the store after every step transition, so an
//! approval pause survives restarts and [`WorkflowEngine::resume`] continues
//! from the saved state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Clock, CommonError};
use cadence_domain::{
    DeadLetter, JobRef, OnError, RunStatus, StepDef, StepStatus, Trigger, WorkflowConfig,
    WorkflowDef, WorkflowRun,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::{WorkflowError, WorkflowResult};
use super::graph::{self, StepDeps};
use super::handler::{HandlerRegistry, StepContext, StepFailure, StepResult};
use super::middleware::StepMiddleware;
use crate::store::Store;
use crate::strategy::{NextAction, StrategyError, StrategyRunner};

/// Workflows may invoke workflows this many levels deep
pub const MAX_NESTING_DEPTH: usize = 8;

/// Delay before re-checking a deferral that gave no hint
const DEFAULT_DEFERRAL: Duration = Duration::from_secs(1);

/// How a run call ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        execution_id: Uuid,
        outputs: BTreeMap<String, Value>,
    },
    /// Paused before a step that needs approval; continue with `resume`
    Checkpoint {
        execution_id: Uuid,
        step: String,
    },
    Failed {
        execution_id: Uuid,
        step: Option<String>,
        error: String,
        rolled_back: Vec<String>,
        dead_lettered: bool,
    },
    Halted {
        execution_id: Uuid,
        step: String,
        reason: String,
    },
    Cancelled {
        execution_id: Uuid,
    },
}

impl RunOutcome {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::Completed { execution_id, .. }
            | Self::Checkpoint { execution_id, .. }
            | Self::Failed { execution_id, .. }
            | Self::Halted { execution_id, .. }
            | Self::Cancelled { execution_id } => *execution_id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Checkpoint { .. } => RunStatus::Awaiting,
            Self::Failed { .. } => RunStatus::Failed,
            Self::Halted { .. } => RunStatus::Halted,
            Self::Cancelled { .. } => RunStatus::Cancelled,
        }
    }
}

/// Executes workflow definitions against a store and a strategy runner
///
/// Cheap to clone; clones share the registry, store and active-run table.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    strategy: StrategyRunner,
    registry: Arc<HandlerRegistry>,
    middleware: Arc<Vec<Arc<dyn StepMiddleware>>>,
    config: WorkflowConfig,
    clock: Arc<dyn Clock>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        strategy: StrategyRunner,
        registry: Arc<HandlerRegistry>,
        config: WorkflowConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            strategy,
            registry,
            middleware: Arc::new(Vec::new()),
            config,
            clock,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Add a hook around every step, rollback and ensure call
    pub fn with_middleware(mut self, middleware: Arc<dyn StepMiddleware>) -> Self {
        Arc::make_mut(&mut self.middleware).push(middleware);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Validate a definition and store it under its name
    pub async fn register(&self, def: &WorkflowDef) -> WorkflowResult<()> {
        graph::validate(def)?;
        self.check_handlers(def)?;
        self.store.register_workflow(def).await?;
        info!(
            workflow = %def.name,
            version = def.version,
            steps = def.steps.len(),
            "workflow.registered"
        );
        Ok(())
    }

    /// Register `def` and run it to completion, failure or checkpoint
    pub async fn run(&self, def: &WorkflowDef, input: Value) -> WorkflowResult<RunOutcome> {
        self.register(def).await?;
        self.start(&def.name, input).await
    }

    /// Run a registered workflow
    #[instrument(skip(self, input))]
    pub async fn start(&self, name: &str, input: Value) -> WorkflowResult<RunOutcome> {
        self.start_nested(name, input, None, 0, CancellationToken::new()).await
    }

    /// Run every registered workflow triggered by `event`
    pub async fn trigger_event(
        &self,
        event: &str,
        payload: Value,
    ) -> WorkflowResult<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        for def in self.store.list_workflows().await? {
            if matches!(&def.trigger, Trigger::Event { name } if name == event) {
                outcomes.push(self.start(&def.name, payload.clone()).await?);
            }
        }
        Ok(outcomes)
    }

    /// Approve the pending step of a checkpointed run and continue it
    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> WorkflowResult<RunOutcome> {
        let mut run = self.load_run(id).await?;
        if run.status != RunStatus::Awaiting {
            return Err(WorkflowError::InvalidRunState {
                id,
                status: run.status,
                expected: RunStatus::Awaiting,
            });
        }
        let def = self.load_def(&run.workflow).await?;

        let approved: HashSet<String> = run
            .steps
            .iter()
            .filter(|(_, rec)| rec.status == StepStatus::Awaiting)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &approved {
            if let Some(rec) = run.steps.get_mut(name) {
                rec.status = StepStatus::Pending;
            }
        }
        info!(
            workflow = %run.workflow,
            execution_id = %id,
            approved = ?approved,
            "workflow.resumed"
        );

        self.execute(def, run, approved, 0, CancellationToken::new()).await
    }

    /// Cancel a run
    ///
    /// A run in progress stops scheduling, interrupts its cancellable steps
    /// and waits for the others. A checkpointed run is settled directly.
    /// Returns `false` when the run has already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> WorkflowResult<bool> {
        let token = self.active.lock().get(&id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!(execution_id = %id, "workflow.cancel_requested");
            return Ok(true);
        }

        let run = self.load_run(id).await?;
        if run.status != RunStatus::Awaiting {
            return Ok(false);
        }
        let def = self.load_def(&run.workflow).await?;
        let token = CancellationToken::new();
        token.cancel();
        self.execute(def, run, HashSet::new(), 0, token).await?;
        Ok(true)
    }

    /// Current persisted state of a run
    pub async fn status(&self, id: Uuid) -> WorkflowResult<WorkflowRun> {
        self.load_run(id).await
    }

    pub async fn dead_letters(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> WorkflowResult<Vec<DeadLetter>> {
        Ok(self.store.list_dead_letters(workflow, limit).await?)
    }

    /// Ids of runs executing in this process
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.lock().keys().copied().collect()
    }

    async fn load_run(&self, id: Uuid) -> WorkflowResult<WorkflowRun> {
        self.store.load_run(id).await?.ok_or(WorkflowError::RunNotFound(id))
    }

    async fn load_def(&self, name: &str) -> WorkflowResult<Arc<WorkflowDef>> {
        self.store
            .get_workflow(name)
            .await?
            .map(Arc::new)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(name.to_string()))
    }

    fn check_handlers(&self, def: &WorkflowDef) -> WorkflowResult<()> {
        for step in &def.steps {
            for job in std::iter::once(&step.job).chain(step.rollback.iter()) {
                if let Some(key) = job.handler_key() {
                    if !self.registry.contains(&key) {
                        return Err(WorkflowError::HandlerNotFound(key));
                    }
                }
            }
            if let Some(condition) = &step.condition {
                if !self.registry.has_predicate(condition) {
                    return Err(WorkflowError::InvalidDefinition {
                        workflow: def.name.clone(),
                        message: format!(
                            "step '{}' uses unknown predicate '{condition}'",
                            step.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn start_nested(
        &self,
        name: &str,
        input: Value,
        parent: Option<Uuid>,
        depth: usize,
        cancel: CancellationToken,
    ) -> WorkflowResult<RunOutcome> {
        if depth > MAX_NESTING_DEPTH {
            return Err(WorkflowError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        let def = self.load_def(name).await?;
        self.check_handlers(&def)?;

        let mut run = WorkflowRun::new(
            &def.name,
            def.version,
            input,
            def.steps.iter().map(|s| s.name.as_str()),
        );
        let now = self.clock.utc_now();
        run.started_at = now;
        run.updated_at = now;
        run.parent = parent;
        info!(workflow = %def.name, execution_id = %run.id, parent = ?parent, "workflow.started");

        self.execute(def, run, HashSet::new(), depth, cancel).await
    }

    fn run_nested(
        &self,
        name: String,
        input: Value,
        parent: Uuid,
        depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, WorkflowResult<RunOutcome>> {
        let engine = self.clone();
        Box::pin(async move {
            engine.start_nested(&name, input, Some(parent), depth, cancel).await
        })
    }

    async fn execute(
        &self,
        def: Arc<WorkflowDef>,
        run: WorkflowRun,
        approved: HashSet<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> WorkflowResult<RunOutcome> {
        let _guard = ActiveRun::register(&self.active, run.id, cancel.clone());
        RunDriver::new(self.clone(), def, run, approved, depth, cancel).drive().await
    }

    /// One gated, timed attempt of a step
    async fn attempt(&self, call: StepCall) -> Attempt {
        let gate =
            self.strategy.pre_execute_check(&call.circuit, call.scope.as_deref(), &call.key).await;
        if let Err(err) = gate {
            return if err.is_deferral() {
                Attempt::Deferred(err)
            } else {
                Attempt::Failed(err.into())
            };
        }

        let result = self.invoke(&call.job, call.ctx, call.timeout, call.depth).await;
        let recorded = match &result {
            Err(StepFailure::Error(err)) => {
                self.strategy.record_result(&call.circuit, Err(err)).await
            }
            _ => self.strategy.record_result(&call.circuit, Ok(())).await,
        };
        if let Err(err) = recorded {
            warn!(circuit = %call.circuit, error = %err, "workflow.record_result_failed");
        }

        match result {
            Ok(output) => Attempt::Succeeded(output),
            Err(StepFailure::Halt(reason)) => Attempt::Halted(reason),
            Err(StepFailure::Error(err)) => Attempt::Failed(err),
        }
    }

    /// Call the code behind `job` with middleware, timeout and cancellation
    async fn invoke(
        &self,
        job: &JobRef,
        ctx: StepContext,
        timeout: Duration,
        depth: usize,
    ) -> StepResult {
        for middleware in self.middleware.iter() {
            middleware.before(&ctx).await;
        }

        let started = Instant::now();
        let cancellation = ctx.cancellation.clone();
        let result = tokio::select! {
            biased;

            _ = cancellation.cancelled() => Err(StepFailure::Error(
                CommonError::task_cancelled_with_reason(ctx.name.clone(), "workflow cancelled"),
            )),
            outcome = tokio::time::timeout(timeout, self.dispatch(job, ctx.clone(), depth)) => {
                outcome.unwrap_or_else(|_| {
                    Err(CommonError::timeout(ctx.name.clone(), timeout).into())
                })
            }
        };

        for middleware in self.middleware.iter() {
            middleware.after(&ctx, &result, started.elapsed()).await;
        }
        result
    }

    async fn dispatch(&self, job: &JobRef, mut ctx: StepContext, depth: usize) -> StepResult {
        let key = match job {
            JobRef::Workflow { name } => return self.dispatch_workflow(name, ctx, depth).await,
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

    async fn dispatch_workflow(&self, name: &str, ctx: StepContext, depth: usize) -> StepResult {
        let outcome = self
            .run_nested(
                name.to_string(),
                ctx.input.clone(),
                ctx.execution_id,
                depth + 1,
                ctx.cancellation,
            )
            .await;

        match outcome {
            Ok(RunOutcome::Completed { outputs, .. }) => {
                Ok(Value::Object(outputs.into_iter().collect()))
            }
            Ok(RunOutcome::Halted { reason, .. }) => Err(StepFailure::Halt(reason)),
            Ok(RunOutcome::Cancelled { .. }) => {
                let reason = "nested workflow cancelled";
                Err(CommonError::task_cancelled_with_reason(name, reason).into())
            }
            Ok(RunOutcome::Failed { error, .. }) => {
                Err(CommonError::internal_with_context(error, format!("workflow '{name}'")).into())
            }
            Ok(RunOutcome::Checkpoint { step, .. }) => Err(CommonError::validation(
                "workflow",
                format!("nested workflow '{name}' paused for approval at '{step}'"),
            )
            .into()),
            Err(err) => Err(CommonError::internal_with_context(
                err.to_string(),
                format!("workflow '{name}'"),
            )
            .into()),
        }
    }
}

/// Removes a run from the active table when execution ends, on any path
struct ActiveRun {
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    id: Uuid,
}

impl ActiveRun {
    fn register(
        active: &Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
        id: Uuid,
        token: CancellationToken,
    ) -> Self {
        active.lock().insert(id, token);
        Self { active: Arc::clone(active), id }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

struct StepCall {
    job: JobRef,
    ctx: StepContext,
    timeout: Duration,
    circuit: String,
    scope: Option<String>,
    key: String,
    depth: usize,
}

enum Attempt {
    Succeeded(Value),
    Failed(CommonError),
    Halted(String),
    Deferred(StrategyError),
}

/// Why a run stopped scheduling new steps
enum Stop {
    Failed { step: Option<String>, error: String, on_error: OnError, action: NextAction },
    Halted { step: String, reason: String },
    Cancelled,
}

/// State of one run while it executes
struct RunDriver {
    engine: WorkflowEngine,
    def: Arc<WorkflowDef>,
    run: WorkflowRun,
    deps: HashMap<String, StepDeps>,
    approved: HashSet<String>,
    /// Steps waiting out a retry delay or deferral
    not_before: HashMap<String, Instant>,
    tasks: JoinSet<Attempt>,
    task_steps: HashMap<TaskId, String>,
    cancel: CancellationToken,
    depth: usize,
    concurrency: usize,
    deadline: Option<Instant>,
    /// Start of the current execution segment; checkpoints end a segment
    segment_started: Instant,
    stop: Option<Stop>,
}

impl RunDriver {
    fn new(
        engine: WorkflowEngine,
        def: Arc<WorkflowDef>,
        run: WorkflowRun,
        approved: HashSet<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        let deps = graph::dependency_map(&def);
        let concurrency = def.max_concurrency.unwrap_or(engine.config.max_concurrency).max(1);
        let segment_started = Instant::now();
        let deadline = def.timeout_ms.map(|ms| {
            let remaining = Duration::from_millis(ms.saturating_sub(run.elapsed_ms));
            segment_started + remaining
        });
        Self {
            engine,
            def,
            run,
            deps,
            approved,
            not_before: HashMap::new(),
            tasks: JoinSet::new(),
            task_steps: HashMap::new(),
            cancel,
            depth,
            concurrency,
            deadline,
            segment_started,
            stop: None,
        }
    }

    async fn drive(mut self) -> WorkflowResult<RunOutcome> {
        self.run.status = RunStatus::Running;
        self.run.checkpoint = None;
        self.persist().await?;

        loop {
            if self.stop.is_none() {
                if self.cancel.is_cancelled() {
                    self.stop = Some(Stop::Cancelled);
                } else if self.deadline.is_some_and(|at| Instant::now() >= at) {
                    self.stop_for_timeout();
                }
            }
            if self.stop.is_none() {
                self.schedule_ready();
            }

            if self.tasks.is_empty() {
                if self.stop.is_some() || self.main_steps_settled() {
                    break;
                }
                if self.not_before.is_empty() {
                    if let Some(step) = self.run.checkpoint.clone() {
                        return self.checkpoint(step).await;
                    }
                    self.stop = Some(Stop::Failed {
                        step: None,
                        error: "no runnable steps remain".to_string(),
                        on_error: OnError::Rollback,
                        action: NextAction::DeadLetter,
                    });
                    break;
                }
            }

            self.wait().await?;
        }

        self.finish().await
    }

    fn main_steps_settled(&self) -> bool {
        self.def.steps.iter().filter(|s| !s.ensure).all(|s| {
            self.run.step_status(&s.name).is_some_and(|status| status.is_settled())
        })
    }

    /// Start every eligible step, repeating while skips unblock others
    fn schedule_ready(&mut self) {
        let now = Instant::now();
        self.not_before.retain(|_, at| *at > now);

        let def = Arc::clone(&self.def);
        loop {
            let mut skipped_any = false;
            for step in def.steps.iter().filter(|s| !s.ensure) {
                if self.tasks.len() >= self.concurrency {
                    return;
                }
                if self.run.step_status(&step.name) != Some(StepStatus::Pending)
                    || self.not_before.contains_key(&step.name)
                    || !self.deps.get(&step.name).is_some_and(|d| d.is_satisfied(&self.run))
                {
                    continue;
                }

                if !self.condition_holds(step) {
                    debug!(workflow = %def.name, step = %step.name, "step.skipped");
                    self.settle(&step.name, StepStatus::Skipped, None, None);
                    skipped_any = true;
                    continue;
                }

                if step.await_approval && !self.approved.contains(&step.name) {
                    if let Some(rec) = self.run.steps.get_mut(&step.name) {
                        rec.status = StepStatus::Awaiting;
                    }
                    self.run.checkpoint.get_or_insert_with(|| step.name.clone());
                    continue;
                }

                self.spawn_step(step);
            }
            if !skipped_any {
                return;
            }
        }
    }

    fn condition_holds(&self, step: &StepDef) -> bool {
        let Some(condition) = &step.condition else {
            return true;
        };
        match self.engine.registry.predicate(condition) {
            Some(predicate) => predicate(&self.run.input, &self.run.outputs()),
            None => false,
        }
    }

    fn step_context(
        &self,
        step: &StepDef,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> StepContext {
        StepContext {
            execution_id: self.run.id,
            workflow: Some(self.def.name.clone()),
            name: step.name.clone(),
            attempt,
            input: self.run.input.clone(),
            args: None,
            outputs: self.run.outputs(),
            cancellation,
        }
    }

    fn step_timeout(&self, step: &StepDef) -> Duration {
        Duration::from_millis(step.timeout_ms.unwrap_or(self.engine.config.default_step_timeout_ms))
    }

    fn spawn_step(&mut self, step: &StepDef) {
        let attempt = self.run.steps.get(&step.name).map_or(0, |rec| rec.attempts) + 1;
        if let Some(rec) = self.run.steps.get_mut(&step.name) {
            rec.status = StepStatus::Running;
            rec.started_at = Some(self.engine.clock.utc_now());
        }

        let cancellation =
            if step.cancellable { self.cancel.child_token() } else { CancellationToken::new() };
        let call = StepCall {
            job: step.job.clone(),
            ctx: self.step_context(step, attempt, cancellation),
            timeout: self.step_timeout(step),
            circuit: step
                .circuit
                .clone()
                .or_else(|| step.job.handler_key())
                .unwrap_or_else(|| format!("workflow:{}", self.def.name)),
            scope: step.rate_limit_scope.clone(),
            key: self.def.name.clone(),
            depth: self.depth,
        };

        let engine = self.engine.clone();
        let handle = self.tasks.spawn(async move { engine.attempt(call).await });
        self.task_steps.insert(handle.id(), step.name.clone());
        debug!(workflow = %self.def.name, step = %step.name, attempt, "step.spawned");
    }

    async fn wait(&mut self) -> WorkflowResult<()> {
        let running = self.stop.is_none();
        let deadline = self.deadline.filter(|_| running);
        let wake = self.not_before.values().min().copied().filter(|_| running);

        tokio::select! {
            biased;

            _ = self.cancel.cancelled(), if running => {
                info!(
                    workflow = %self.def.name,
                    execution_id = %self.run.id,
                    "workflow.cancelling"
                );
                self.stop = Some(Stop::Cancelled);
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                self.stop_for_timeout();
            }
            joined = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                if let Some(joined) = joined {
                    self.on_joined(joined).await?;
                }
            }
            _ = sleep_until(wake), if wake.is_some() => {}
            else => {}
        }
        Ok(())
    }

    fn stop_for_timeout(&mut self) {
        let timeout_ms = self.def.timeout_ms.unwrap_or_default();
        warn!(
            workflow = %self.def.name,
            execution_id = %self.run.id,
            timeout_ms,
            "workflow.timed_out"
        );
        self.tasks.abort_all();
        self.stop = Some(Stop::Failed {
            step: None,
            error: format!("workflow timed out after {timeout_ms}ms"),
            on_error: OnError::Rollback,
            action: NextAction::DeadLetter,
        });
    }

    async fn on_joined(
        &mut self,
        joined: Result<(TaskId, Attempt), JoinError>,
    ) -> WorkflowResult<()> {
        let (id, attempt) = match joined {
            Ok(done) => done,
            Err(err) if err.is_cancelled() => {
                if let Some(step) = self.task_steps.remove(&err.id()) {
                    self.settle(&step, StepStatus::Cancelled, None, Some("aborted".to_string()));
                }
                return self.persist().await;
            }
            Err(err) => {
                let failure = CommonError::internal(format!("step task failed: {err}"));
                (err.id(), Attempt::Failed(failure))
            }
        };
        let Some(step) = self.task_steps.remove(&id) else {
            return Ok(());
        };

        match attempt {
            Attempt::Succeeded(output) => {
                self.bump_attempts(&step);
                self.settle(&step, StepStatus::Completed, Some(output), None);
                self.run.completion_order.push(step);
            }
            Attempt::Halted(reason) => {
                self.bump_attempts(&step);
                self.settle(&step, StepStatus::Failed, None, Some(format!("halted: {reason}")));
                if self.stop.is_none() {
                    info!(
                        workflow = %self.def.name,
                        step = %step,
                        reason = %reason,
                        "workflow.halting"
                    );
                    self.stop = Some(Stop::Halted { step, reason });
                }
            }
            Attempt::Deferred(err) => self.on_deferred(step, err),
            Attempt::Failed(err) => self.on_failed(step, err).await?,
        }
        self.persist().await
    }

    fn on_deferred(&mut self, step: String, err: StrategyError) {
        let max_deferrals = self.engine.config.max_deferrals;
        let deferrals = match self.run.steps.get_mut(&step) {
            Some(rec) => {
                rec.deferrals += 1;
                rec.status = StepStatus::Pending;
                rec.deferrals
            }
            None => return,
        };

        if self.stop.is_some() {
            return;
        }
        if deferrals > max_deferrals {
            let error = format!("deferred {deferrals} times: {err}");
            self.settle(&step, StepStatus::Failed, None, Some(error.clone()));
            let on_error = self.def.step(&step).map(|s| s.on_error).unwrap_or_default();
            self.stop = Some(Stop::Failed {
                step: Some(step),
                error,
                on_error,
                action: NextAction::DeadLetter,
            });
            return;
        }

        let delay = err.retry_after().unwrap_or(DEFAULT_DEFERRAL);
        debug!(
            workflow = %self.def.name,
            step = %step,
            delay_ms = delay.as_millis() as u64,
            "step.deferred"
        );
        self.not_before.insert(step, Instant::now() + delay);
    }

    async fn on_failed(&mut self, step: String, err: CommonError) -> WorkflowResult<()> {
        let attempts = self.bump_attempts(&step);

        if self.cancel.is_cancelled() && matches!(err, CommonError::TaskCancelled { .. }) {
            self.settle(&step, StepStatus::Cancelled, None, Some(err.to_string()));
            return Ok(());
        }
        if self.stop.is_some() {
            self.settle(&step, StepStatus::Failed, None, Some(err.to_string()));
            return Ok(());
        }

        let Some(step_def) = self.def.step(&step).cloned() else {
            return Ok(());
        };
        let policy = self.def.retry_for(&step_def);
        let action = self.engine.strategy.next_action(&err, attempts, Some(policy)).await?;

        if let NextAction::Retry { delay } = action {
            if let Some(rec) = self.run.steps.get_mut(&step) {
                rec.status = StepStatus::Pending;
                rec.error = Some(err.to_string());
            }
            info!(
                workflow = %self.def.name,
                step = %step,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step.retry_scheduled"
            );
            self.not_before.insert(step, Instant::now() + delay);
            return Ok(());
        }

        warn!(workflow = %self.def.name, step = %step, attempts, error = %err, "step.failed");
        self.settle(&step, StepStatus::Failed, None, Some(err.to_string()));
        self.stop = Some(Stop::Failed {
            step: Some(step),
            error: err.to_string(),
            on_error: step_def.on_error,
            action,
        });
        Ok(())
    }

    fn bump_attempts(&mut self, step: &str) -> u32 {
        match self.run.steps.get_mut(step) {
            Some(rec) => {
                rec.attempts += 1;
                rec.attempts
            }
            None => 0,
        }
    }

    fn settle(
        &mut self,
        step: &str,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let now = self.engine.clock.utc_now();
        if let Some(rec) = self.run.steps.get_mut(step) {
            rec.status = status;
            rec.finished_at = Some(now);
            if output.is_some() {
                rec.output = output;
            }
            rec.error = error;
        }
    }

    async fn persist(&mut self) -> WorkflowResult<()> {
        self.run.updated_at = self.engine.clock.utc_now();
        self.engine.store.save_run(&self.run).await?;
        Ok(())
    }

    fn close_segment(&mut self) {
        let spent = u64::try_from(self.segment_started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.run.elapsed_ms = self.run.elapsed_ms.saturating_add(spent);
        self.segment_started = Instant::now();
    }

    async fn checkpoint(mut self, step: String) -> WorkflowResult<RunOutcome> {
        self.close_segment();
        self.run.status = RunStatus::Awaiting;
        self.persist().await?;
        info!(
            workflow = %self.def.name,
            execution_id = %self.run.id,
            step = %step,
            "workflow.checkpoint"
        );
        Ok(RunOutcome::Checkpoint { execution_id: self.run.id, step })
    }

    async fn finish(mut self) -> WorkflowResult<RunOutcome> {
        let execution_id = self.run.id;
        let outcome = match self.stop.take() {
            None => RunOutcome::Completed { execution_id, outputs: self.run.outputs() },
            Some(Stop::Cancelled) => RunOutcome::Cancelled { execution_id },
            Some(Stop::Halted { step, reason }) => {
                self.run.error = Some(format!("halted at '{step}': {reason}"));
                RunOutcome::Halted { execution_id, step, reason }
            }
            Some(Stop::Failed { step, error, on_error, action }) => {
                let rolled_back = match on_error {
                    OnError::Halt => Vec::new(),
                    OnError::Rollback => self.rollback(None).await,
                    OnError::RollbackSelf => self.rollback(step.as_deref()).await,
                };
                let dead_lettered = self.def.dead_letter
                    && action != NextAction::Discard
                    && rolled_back.is_empty();
                if dead_lettered {
                    self.record_dead_letter(step.clone(), error.clone()).await?;
                }
                self.run.error = Some(error.clone());
                RunOutcome::Failed { execution_id, step, error, rolled_back, dead_lettered }
            }
        };

        self.cancel_unsettled();
        self.run_ensure_steps().await;

        self.close_segment();
        self.run.status = outcome.status();
        self.run.finished_at = Some(self.engine.clock.utc_now());
        self.persist().await?;
        info!(
            workflow = %self.def.name,
            execution_id = %execution_id,
            status = %self.run.status,
            "workflow.finished"
        );
        Ok(outcome)
    }

    /// Compensate completed steps, newest first; `failed` goes first when
    /// the failing step should undo its own partial work
    async fn rollback(&mut self, failed: Option<&str>) -> Vec<String> {
        let mut order: Vec<String> = failed.map(str::to_string).into_iter().collect();
        order.extend(self.run.completion_order.iter().rev().cloned());

        let mut rolled_back = Vec::new();
        for name in order {
            let Some(step) = self.def.step(&name).cloned() else {
                continue;
            };
            let Some(compensation) = &step.rollback else {
                continue;
            };

            let ctx = self.step_context(&step, 1, CancellationToken::new());
            let timeout = self.step_timeout(&step);
            match self.engine.invoke(compensation, ctx, timeout, self.depth).await {
                Ok(_) => {
                    if let Some(rec) = self.run.steps.get_mut(&name) {
                        rec.rolled_back = true;
                    }
                    info!(workflow = %self.def.name, step = %name, "step.rolled_back");
                    rolled_back.push(name);
                }
                Err(err) => {
                    warn!(
                        workflow = %self.def.name,
                        step = %name,
                        error = %err,
                        "step.rollback_failed"
                    );
                }
            }
        }
        self.run.rolled_back = rolled_back.clone();
        rolled_back
    }

    async fn record_dead_letter(&self, step: Option<String>, error: String) -> WorkflowResult<()> {
        let attempts = step
            .as_deref()
            .and_then(|s| self.run.steps.get(s))
            .map_or(0, |rec| rec.attempts);
        let letter = DeadLetter {
            id: Uuid::now_v7(),
            execution_id: self.run.id,
            workflow: self.def.name.clone(),
            step,
            error,
            attempts,
            input: self.run.input.clone(),
            recorded_at: self.engine.clock.utc_now(),
        };
        self.engine.store.record_dead_letter(&letter).await?;
        warn!(workflow = %self.def.name, execution_id = %self.run.id, "workflow.dead_lettered");
        Ok(())
    }

    fn cancel_unsettled(&mut self) {
        let now = self.engine.clock.utc_now();
        for step in self.def.steps.iter().filter(|s| !s.ensure) {
            if let Some(rec) = self.run.steps.get_mut(&step.name) {
                if !rec.status.is_settled() {
                    rec.status = StepStatus::Cancelled;
                    rec.finished_at = Some(now);
                }
            }
        }
    }

    /// Cleanup steps run in declaration order; their failures are logged
    /// and do not change the outcome
    async fn run_ensure_steps(&mut self) {
        let def = Arc::clone(&self.def);
        for step in def.steps.iter().filter(|s| s.ensure) {
            if !self.condition_holds(step) {
                self.settle(&step.name, StepStatus::Skipped, None, None);
                continue;
            }
            if let Some(rec) = self.run.steps.get_mut(&step.name) {
                rec.status = StepStatus::Running;
                rec.started_at = Some(self.engine.clock.utc_now());
                rec.attempts += 1;
            }

            let ctx = self.step_context(step, 1, CancellationToken::new());
            match self.engine.invoke(&step.job, ctx, self.step_timeout(step), self.depth).await {
                Ok(output) => self.settle(&step.name, StepStatus::Completed, Some(output), None),
                Err(err) => {
                    warn!(
                        workflow = %def.name,
                        step = %step.name,
                        error = %err,
                        "step.ensure_failed"
                    );
                    self.settle(&step.name, StepStatus::Failed, None, Some(err.to_string()));
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
