//! Store contract on top of a key-value backend
//!
//! Values are JSON documents. Cross-key updates (job plus due index plus
//! execution) are not transactional; the claim and unique locks taken by the
//! scheduler keep two nodes from mutating the same job concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_common::Clock;
use cadence_core::store::{
    unique_lock_key, ExecutionStore, JobStore, LockStore, StoreError, StoreResult, WorkflowStore,
};
use cadence_domain::constants::EVENT_CHANNEL_CAPACITY;
use cadence_domain::{
    DeadLetter, Execution, ExecutionStatus, Job, JobEvent, JobState, RunStatus, StoreConfig,
    WorkflowDef, WorkflowRun,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::KvBackend;
use super::keys::KeyLayout;

const RESCUE_REASON: &str = "heartbeat lost";

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Backend(format!("failed to encode value for '{key}': {e}")))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Corrupt { key: key.to_string(), message: e.to_string() })
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// [`Store`](cadence_core::store::Store) backed by any [`KvBackend`]
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    keys: KeyLayout,
    max_history: usize,
    events: broadcast::Sender<JobEvent>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>, config: &StoreConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            clock,
            keys: KeyLayout::new(config.key_prefix.clone()),
            max_history: config.max_history.max(1),
            events,
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    /// Notify local subscribers and the backend's event channel
    async fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event.clone());
        let channel = self.keys.events();
        match serde_json::to_string(&event) {
            Ok(message) => {
                if let Err(err) = self.backend.publish(&channel, &message).await {
                    warn!(event = event.name(), error = %err, "store.publish_failed");
                }
            }
            Err(err) => warn!(event = event.name(), error = %err, "store.publish_failed"),
        }
    }

    async fn load_job(&self, name: &str) -> StoreResult<Option<Job>> {
        let key = self.keys.jobs();
        match self.backend.hget(&key, name).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn require_job(&self, name: &str) -> StoreResult<Job> {
        self.load_job(name).await?.ok_or_else(|| StoreError::JobNotFound(name.to_string()))
    }

    /// Write a job and keep the due index in step with it
    async fn save_job(&self, job: &Job, previous: Option<&Job>) -> StoreResult<()> {
        let key = self.keys.jobs();
        self.backend.hset(&key, &job.name, &encode(&key, job)?).await?;

        if let Some(previous) =
            previous.filter(|p| p.queue != job.queue || p.priority != job.priority)
        {
            let stale = self.keys.due(&previous.queue, previous.priority);
            self.backend.zrem(&stale, &job.name).await?;
        }
        let due = self.keys.due(&job.queue, job.priority);
        match job.next_run_at {
            Some(at) if job.state == JobState::Idle => {
                self.backend.zadd(&due, &job.name, millis(at)).await?;
                let bands = self.keys.due_bands(&job.queue);
                let band = job.priority.to_string();
                self.backend.zadd(&bands, &band, i64::from(job.priority)).await?;
                self.backend.hset(&self.keys.queues(), &job.queue, "").await?;
            }
            _ => {
                self.backend.zrem(&due, &job.name).await?;
            }
        }
        Ok(())
    }

    /// Due jobs of one queue, walking priority bands lowest first until
    /// `limit` jobs are found
    async fn due_in_queue(
        &self,
        now: DateTime<Utc>,
        queue: &str,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let mut due = Vec::new();
        let bands = self.keys.due_bands(queue);
        for (_, score) in self.backend.zrange_by_score(&bands, i64::MAX, usize::MAX).await? {
            if due.len() >= limit {
                break;
            }
            let Ok(priority) = i32::try_from(score) else { continue };
            let key = self.keys.due(queue, priority);
            let entries = self.backend.zrange_by_score(&key, millis(now), limit - due.len()).await?;
            for (name, _) in entries {
                let job = self.load_job(&name).await?;
                match job.filter(|job| job.queue == queue && job.priority == priority) {
                    Some(job) if job.is_due(now) => due.push(job),
                    Some(_) => {}
                    None => {
                        debug!(job = %name, "store.stale_due_entry");
                        self.backend.zrem(&key, &name).await?;
                    }
                }
            }
        }
        Ok(due)
    }

    async fn load_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        let key = self.keys.executions();
        match self.backend.hget(&key, &KeyLayout::execution_field(id)).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Write an execution, maintain the running and heartbeat indexes and
    /// cap the job's history
    async fn save_execution(&self, execution: &Execution) -> StoreResult<()> {
        let key = self.keys.executions();
        let field = KeyLayout::execution_field(execution.id);
        let is_new = self.backend.hget(&key, &field).await?.is_none();
        self.backend.hset(&key, &field, &encode(&key, execution)?).await?;

        let running = self.keys.running(&execution.job_name);
        let heartbeats = self.keys.heartbeats();
        if execution.is_running() {
            self.backend.hset(&running, &field, &execution.node).await?;
            let beat = execution.heartbeat_at.unwrap_or(execution.started_at);
            self.backend.zadd(&heartbeats, &field, millis(beat)).await?;
        } else {
            self.backend.hdel(&running, &field).await?;
            self.backend.zrem(&heartbeats, &field).await?;
        }

        if is_new {
            let history = self.keys.history(&execution.job_name);
            let len = self.backend.lpush(&history, &field).await?;
            if len > self.max_history {
                self.trim_history(&history).await?;
            }
        }
        Ok(())
    }

    async fn trim_history(&self, history: &str) -> StoreResult<()> {
        let overflow = self.backend.lrange(history, self.max_history, usize::MAX).await?;
        self.backend.ltrim(history, self.max_history).await?;
        for field in overflow {
            let Ok(id) = field.parse::<Uuid>() else { continue };
            if self.load_execution(id).await?.is_some_and(|e| e.is_running()) {
                continue;
            }
            self.backend.hdel(&self.keys.executions(), &field).await?;
        }
        Ok(())
    }

    async fn history_ids(&self, job: &str) -> StoreResult<Vec<Uuid>> {
        let fields = self.backend.lrange(&self.keys.history(job), 0, usize::MAX).await?;
        Ok(fields.iter().filter_map(|field| field.parse().ok()).collect())
    }

    async fn hash_values<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Vec<T>> {
        let entries = self.backend.hgetall(key).await?;
        entries.iter().map(|(_, raw)| decode(key, raw)).collect()
    }
}

#[async_trait]
impl JobStore for KvStore {
    async fn register_job(&self, job: &Job) -> StoreResult<()> {
        let previous = self.load_job(&job.name).await?;
        self.save_job(job, previous.as_ref()).await?;
        self.publish(JobEvent::JobRegistered { job: job.name.clone(), at: self.clock.utc_now() })
            .await;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> StoreResult<Option<Job>> {
        self.load_job(name).await
    }

    async fn list_jobs(&self, queue: Option<&str>) -> StoreResult<Vec<Job>> {
        let jobs: Vec<Job> = self.hash_values(&self.keys.jobs()).await?;
        Ok(jobs.into_iter().filter(|job| queue.map_or(true, |q| job.queue == q)).collect())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let previous = self.require_job(&job.name).await?;
        self.save_job(job, Some(&previous)).await
    }

    async fn delete_job(&self, name: &str) -> StoreResult<bool> {
        let Some(job) = self.load_job(name).await? else {
            return Ok(false);
        };
        self.backend.hdel(&self.keys.jobs(), name).await?;
        self.backend.zrem(&self.keys.due(&job.queue, job.priority), name).await?;

        let executions = self.keys.executions();
        let heartbeats = self.keys.heartbeats();
        for id in self.history_ids(name).await? {
            let field = KeyLayout::execution_field(id);
            self.backend.hdel(&executions, &field).await?;
            self.backend.zrem(&heartbeats, &field).await?;
        }
        self.backend.delete(&self.keys.history(name)).await?;
        self.backend.delete(&self.keys.running(name)).await?;

        self.publish(JobEvent::JobDeleted { job: name.to_string(), at: self.clock.utc_now() })
            .await;
        Ok(true)
    }

    async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        queue: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let queues = match queue {
            Some(queue) => vec![queue.to_string()],
            None => {
                let known = self.backend.hgetall(&self.keys.queues()).await?;
                known.into_iter().map(|(queue, _)| queue).collect()
            }
        };
        let mut due = Vec::new();
        for queue in &queues {
            due.extend(self.due_in_queue(now, queue, limit).await?);
        }
        due.sort_by_key(|job| (job.priority, job.next_run_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_running(
        &self,
        name: &str,
        execution: &Execution,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        let mut job = self.require_job(name).await?;
        job.state = JobState::Active;
        job.run_count += 1;
        job.last_run_at = Some(execution.started_at);
        job.next_run_at = next_run_at;
        job.updated_at = self.clock.utc_now();
        self.save_job(&job, None).await?;
        self.save_execution(execution).await?;

        self.publish(JobEvent::JobStarted {
            job: name.to_string(),
            execution_id: execution.id,
            node: execution.node.clone(),
            at: execution.started_at,
        })
        .await;
        Ok(job)
    }

    async fn mark_completed(&self, name: &str, execution: &Execution) -> StoreResult<Job> {
        let mut job = self.require_job(name).await?;
        job.state = JobState::Idle;
        job.attempt = 0;
        job.last_result = execution.result.clone();
        job.last_error = None;
        job.updated_at = self.clock.utc_now();
        self.save_job(&job, None).await?;
        self.save_execution(execution).await?;

        self.publish(JobEvent::JobCompleted {
            job: name.to_string(),
            execution_id: execution.id,
            duration_ms: execution.duration_ms,
            at: execution.completed_at.unwrap_or(job.updated_at),
        })
        .await;
        Ok(job)
    }

    async fn mark_failed(
        &self,
        name: &str,
        execution: &Execution,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Job> {
        let mut job = self.require_job(name).await?;
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
        job.updated_at = self.clock.utc_now();
        self.save_job(&job, None).await?;
        self.save_execution(execution).await?;

        self.publish(JobEvent::JobFailed {
            job: name.to_string(),
            execution_id: execution.id,
            error: execution.error.clone().unwrap_or_default(),
            at: job.updated_at,
        })
        .await;
        Ok(job)
    }

    async fn mark_cancelled(&self, name: &str, execution: Option<&Execution>) -> StoreResult<Job> {
        let mut job = self.require_job(name).await?;
        job.state = JobState::Idle;
        job.attempt = 0;
        job.updated_at = self.clock.utc_now();
        self.save_job(&job, None).await?;
        if let Some(execution) = execution {
            self.save_execution(execution).await?;
        }

        self.publish(JobEvent::JobCancelled {
            job: name.to_string(),
            execution_id: execution.map(|e| e.id),
            at: job.updated_at,
        })
        .await;
        Ok(job)
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        self.backend.delete(&self.keys.lock(&unique_lock_key(name))).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl LockStore for KvStore {
    async fn acquire_unique_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<()> {
        let lock = self.keys.lock(key);
        // A holder can vanish between the failed set and the read; one more
        // attempt covers that window.
        for _ in 0..2 {
            if self.backend.set_nx(&lock, owner, Some(ttl)).await? {
                return Ok(());
            }
            if self.backend.compare_and_expire(&lock, owner, ttl).await? {
                return Ok(());
            }
            if let Some(holder) = self.backend.get(&lock).await? {
                return Err(StoreError::LockConflict { key: key.to_string(), owner: holder });
            }
        }
        Err(StoreError::LockConflict { key: key.to_string(), owner: "unknown".to_string() })
    }

    async fn release_unique_lock(&self, key: &str, owner: &str) -> StoreResult<bool> {
        Ok(self.backend.compare_and_delete(&self.keys.lock(key), owner).await?)
    }

    async fn lock_owner(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.backend.get(&self.keys.lock(key)).await?)
    }
}

#[async_trait]
impl ExecutionStore for KvStore {
    async fn record_execution_start(&self, execution: &Execution) -> StoreResult<()> {
        self.save_execution(execution).await
    }

    async fn record_execution_complete(&self, execution: &Execution) -> StoreResult<()> {
        self.save_execution(execution).await
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        self.load_execution(id).await
    }

    async fn get_executions(
        &self,
        job: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<Execution>> {
        let mut found = Vec::new();
        for id in self.history_ids(job).await? {
            if let Some(execution) = self.load_execution(id).await? {
                if since.map_or(true, |s| execution.started_at >= s) {
                    found.push(execution);
                }
            }
        }
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn prune_executions(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let mut expired: Vec<Execution> = self
            .hash_values::<Execution>(&self.keys.executions())
            .await?
            .into_iter()
            .filter(|e| !e.is_running() && e.started_at < before)
            .collect();
        expired.sort_by_key(|e| e.started_at);
        expired.truncate(limit);

        let key = self.keys.executions();
        for execution in &expired {
            let field = KeyLayout::execution_field(execution.id);
            self.backend.hdel(&key, &field).await?;
            self.backend.lrem(&self.keys.history(&execution.job_name), &field).await?;
        }
        Ok(expired.len())
    }

    async fn record_heartbeat(&self, job: &str, node: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let key = self.keys.executions();
        for (field, owner) in self.backend.hgetall(&self.keys.running(job)).await? {
            if owner != node {
                continue;
            }
            let Some(raw) = self.backend.hget(&key, &field).await? else { continue };
            let mut execution: Execution = decode(&key, &raw)?;
            execution.heartbeat_at = Some(at);
            self.backend.hset(&key, &field, &encode(&key, &execution)?).await?;
            self.backend.zadd(&self.keys.heartbeats(), &field, millis(at)).await?;
        }
        Ok(())
    }

    async fn get_stuck_executions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Execution>> {
        let heartbeats = self.keys.heartbeats();
        let silent =
            self.backend.zrange_by_score(&heartbeats, millis(cutoff) - 1, usize::MAX).await?;
        let mut stuck = Vec::with_capacity(silent.len());
        for (field, _) in silent {
            let Ok(id) = field.parse::<Uuid>() else { continue };
            match self.load_execution(id).await? {
                Some(execution) if execution.is_running() => stuck.push(execution),
                _ => {
                    self.backend.zrem(&self.keys.heartbeats(), &field).await?;
                }
            }
        }
        Ok(stuck)
    }

    async fn mark_execution_rescued(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Execution> {
        let mut execution =
            self.load_execution(id).await?.ok_or(StoreError::ExecutionNotFound(id))?;
        if !execution.is_running() {
            return Ok(execution);
        }
        execution.finish(ExecutionStatus::Rescued, at, None, Some(RESCUE_REASON.to_string()));
        execution.heartbeat_at = None;
        self.save_execution(&execution).await?;

        if let Some(mut job) = self.load_job(&execution.job_name).await? {
            job.state = JobState::Idle;
            job.updated_at = at;
            self.save_job(&job, None).await?;
        }
        self.release_lock(&execution.job_name).await?;

        self.publish(JobEvent::JobRescued { job: execution.job_name.clone(), execution_id: id, at })
            .await;
        Ok(execution)
    }
}

#[async_trait]
impl WorkflowStore for KvStore {
    async fn register_workflow(&self, def: &WorkflowDef) -> StoreResult<()> {
        let key = self.keys.workflows();
        self.backend.hset(&key, &def.name, &encode(&key, def)?).await?;
        Ok(())
    }

    async fn get_workflow(&self, name: &str) -> StoreResult<Option<WorkflowDef>> {
        let key = self.keys.workflows();
        match self.backend.hget(&key, name).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> StoreResult<Vec<WorkflowDef>> {
        self.hash_values(&self.keys.workflows()).await
    }

    async fn delete_workflow(&self, name: &str) -> StoreResult<bool> {
        Ok(self.backend.hdel(&self.keys.workflows(), name).await?)
    }

    async fn save_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let key = self.keys.runs();
        self.backend.hset(&key, &run.id.to_string(), &encode(&key, run)?).await?;
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> StoreResult<Option<WorkflowRun>> {
        let key = self.keys.runs();
        match self.backend.hget(&key, &id.to_string()).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> StoreResult<Vec<WorkflowRun>> {
        let runs: Vec<WorkflowRun> = self.hash_values(&self.keys.runs()).await?;
        Ok(runs.into_iter().filter(|run| status.map_or(true, |s| run.status == s)).collect())
    }

    async fn delete_run(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.backend.hdel(&self.keys.runs(), &id.to_string()).await?)
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> StoreResult<()> {
        let key = self.keys.dead_letters();
        self.backend.lpush(&key, &encode(&key, letter)?).await?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<DeadLetter>> {
        let key = self.keys.dead_letters();
        let mut letters = Vec::new();
        for raw in self.backend.lrange(&key, 0, usize::MAX).await? {
            let letter: DeadLetter = decode(&key, &raw)?;
            if workflow.map_or(true, |w| letter.workflow == w) {
                letters.push(letter);
                if letters.len() >= limit {
                    break;
                }
            }
        }
        Ok(letters)
    }
}
