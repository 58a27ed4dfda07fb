//! In-memory implementation of the store ports
//!
//! Keeps everything behind one mutex; lock expiry follows the injected mock
//! clock so TTL behaviour is deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadence_common::{Clock, MockClock};
use cadence_core::store::{
    unique_lock_key, ExecutionStore, JobStore, LockStore, StoreError, StoreResult, WorkflowStore,
};
use cadence_domain::{
    DeadLetter, Execution, ExecutionStatus, Job, JobEvent, JobState, RunStatus, WorkflowDef,
    WorkflowRun,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: BTreeMap<String, Job>,
    locks: HashMap<String, (String, Instant)>,
    executions: Vec<Execution>,
    workflows: BTreeMap<String, WorkflowDef>,
    runs: HashMap<Uuid, WorkflowRun>,
    dead_letters: Vec<DeadLetter>,
    run_saves: usize,
    failing_completions: usize,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: MockClock,
    events: broadcast::Sender<JobEvent>,
}

impl MemoryStore {
    pub fn new(clock: MockClock) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { state: Arc::new(Mutex::new(State::default())), clock, events }
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    pub fn run_saves(&self) -> usize {
        self.state.lock().run_saves
    }

    /// Make the next `count` `mark_completed` calls fail with a backend error
    pub fn fail_completions(&self, count: usize) {
        self.state.lock().failing_completions = count;
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.state.lock().executions.clone()
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn update_execution(state: &mut State, execution: &Execution) {
        match state.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) => *existing = execution.clone(),
            None => state.executions.push(execution.clone()),
        }
    }

    fn job_mut<'a>(state: &'a mut State, name: &str) -> StoreResult<&'a mut Job> {
        state.jobs.get_mut(name).ok_or_else(|| StoreError::JobNotFound(name.to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn register_job(&self, job: &Job) -> StoreResult<()> {
        self.state.lock().jobs.insert(job.name.clone(), job.clone());
        self.publish(JobEvent::JobRegistered { job: job.name.clone(), at: self.clock.utc_now() });
        Ok(())
    }

    async fn get_job(&self, name: &str) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().jobs.get(name).cloned())
    }

    async fn list_jobs(&self, queue: Option<&str>) -> StoreResult<Vec<Job>> {
        let state = self.state.lock();
        Ok(state.jobs.values().filter(|j| queue.map_or(true, |q| j.queue == q)).cloned().collect())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let mut state = self.state.lock();
        *Self::job_mut(&mut state, &job.name)? = job.clone();
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> StoreResult<bool> {
        let removed = self.state.lock().jobs.remove(name).is_some();
        if removed {
            self.publish(JobEvent::JobDeleted { job: name.to_string(), at: self.clock.utc_now() });
        }
        Ok(removed)
    }

    async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        queue: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let state = self.state.lock();
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| queue.map_or(true, |q| j.queue == q) && j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.priority, j.next_run_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_running(
        &self,
        name: &str,
        execution: &Execution,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        let mut state = self.state.lock();
        let job = Self::job_mut(&mut state, name)?;
        job.state = JobState::Active;
        job.run_count += 1;
        job.last_run_at = Some(execution.started_at);
        job.next_run_at = next_run_at;
        let job = job.clone();
        Self::update_execution(&mut state, execution);
        drop(state);
        self.publish(JobEvent::JobStarted {
            job: name.to_string(),
            execution_id: execution.id,
            node: execution.node.clone(),
            at: execution.started_at,
        });
        Ok(job)
    }

    async fn mark_completed(&self, name: &str, execution: &Execution) -> StoreResult<Job> {
        let mut state = self.state.lock();
        if state.failing_completions > 0 {
            state.failing_completions -= 1;
            return Err(StoreError::Backend("connection reset".into()));
        }
        let job = Self::job_mut(&mut state, name)?;
        job.state = JobState::Idle;
        job.attempt = 0;
        job.last_result = execution.result.clone();
        job.last_error = None;
        let job = job.clone();
        Self::update_execution(&mut state, execution);
        Ok(job)
    }

    async fn mark_failed(
        &self,
        name: &str,
        execution: &Execution,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        let mut state = self.state.lock();
        let job = Self::job_mut(&mut state, name)?;
        job.state = JobState::Idle;
        job.error_count += 1;
        job.last_error = execution.error.clone();
        match retry_at {
            Some(at) => {
                job.attempt += 1;
                job.next_run_at = Some(at);
            }
            None => job.attempt = 0,
        }
        let job = job.clone();
        Self::update_execution(&mut state, execution);
        Ok(job)
    }

    async fn mark_cancelled(&self, name: &str, execution: Option<&Execution>) -> StoreResult<Job> {
        let mut state = self.state.lock();
        let job = Self::job_mut(&mut state, name)?;
        job.state = JobState::Idle;
        job.attempt = 0;
        let job = job.clone();
        if let Some(execution) = execution {
            Self::update_execution(&mut state, execution);
        }
        Ok(job)
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        self.state.lock().locks.remove(&unique_lock_key(name));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn acquire_unique_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some((holder, expires)) = state.locks.get(key) {
            if *expires > now && holder != owner {
                let owner = holder.clone();
                return Err(StoreError::LockConflict { key: key.to_string(), owner });
            }
        }
        state.locks.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(())
    }

    async fn release_unique_lock(&self, key: &str, owner: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.locks.get(key).is_some_and(|(holder, _)| holder == owner) {
            state.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn lock_owner(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let state = self.state.lock();
        Ok(state.locks.get(key).filter(|(_, expires)| *expires > now).map(|(o, _)| o.clone()))
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn record_execution_start(&self, execution: &Execution) -> StoreResult<()> {
        Self::update_execution(&mut self.state.lock(), execution);
        Ok(())
    }

    async fn record_execution_complete(&self, execution: &Execution) -> StoreResult<()> {
        Self::update_execution(&mut self.state.lock(), execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.state.lock().executions.iter().find(|e| e.id == id).cloned())
    }

    async fn get_executions(
        &self,
        job: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<Execution>> {
        let state = self.state.lock();
        let mut found: Vec<Execution> = state
            .executions
            .iter()
            .filter(|e| e.job_name == job && since.map_or(true, |s| e.started_at >= s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn prune_executions(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let mut pruned = 0;
        state.executions.retain(|e| {
            let drop = pruned < limit && !e.is_running() && e.started_at < before;
            if drop {
                pruned += 1;
            }
            !drop
        });
        Ok(pruned)
    }

    async fn record_heartbeat(&self, job: &str, _node: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.lock();
        let running = state.executions.iter_mut().filter(|e| e.job_name == job && e.is_running());
        for execution in running {
            execution.heartbeat_at = Some(at);
        }
        Ok(())
    }

    async fn get_stuck_executions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Execution>> {
        let state = self.state.lock();
        Ok(state
            .executions
            .iter()
            .filter(|e| e.is_running() && e.heartbeat_at.map_or(true, |at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn mark_execution_rescued(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Execution> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution.finish(ExecutionStatus::Rescued, at, None, Some("heartbeat lost".into()));
        execution.heartbeat_at = None;
        let execution = execution.clone();
        if let Some(job) = state.jobs.get_mut(&execution.job_name) {
            job.state = JobState::Idle;
        }
        state.locks.remove(&unique_lock_key(&execution.job_name));
        drop(state);
        self.publish(JobEvent::JobRescued {
            job: execution.job_name.clone(),
            execution_id: id,
            at,
        });
        Ok(execution)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn register_workflow(&self, def: &WorkflowDef) -> StoreResult<()> {
        self.state.lock().workflows.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn get_workflow(&self, name: &str) -> StoreResult<Option<WorkflowDef>> {
        Ok(self.state.lock().workflows.get(name).cloned())
    }

    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowDef>> {
        Ok(self.state.lock().workflows.values().cloned().collect())
    }

    async fn delete_workflow(&self, name: &str) -> StoreResult<bool> {
        Ok(self.state.lock().workflows.remove(name).is_some())
    }

    async fn save_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.run_saves += 1;
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.state.lock().runs.get(&id).cloned())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<WorkflowRun>> {
        let state = self.state.lock();
        let runs = state.runs.values().filter(|r| status.map_or(true, |s| r.status == s));
        Ok(runs.cloned().collect())
    }

    async fn delete_run(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.state.lock().runs.remove(&id).is_some())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> StoreResult<()> {
        self.state.lock().dead_letters.push(letter.clone());
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetter>> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|l| workflow.map_or(true, |w| l.workflow == w))
            .take(limit)
            .cloned()
            .collect())
    }
}
