//! Integration tests for the key-value store
//!
//! Runs the scheduler and the raw store contract against `KvStore` over a
//! `MemoryBackend`, with a mock clock driving due times and lock expiry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Clock, MockClock};
use cadence_core::scheduler::JobScheduler;
use cadence_core::store::{unique_lock_key, ExecutionStore, JobStore, LockStore, StoreError};
use cadence_core::strategy::StrategyRunner;
use cadence_core::workflow::HandlerRegistry;
use cadence_domain::{
    Execution, ExecutionStatus, Job, JobEvent, JobRef, JobState, Schedule, SchedulerConfig,
    StoreConfig, StrategyConfig,
};
use cadence_infra::kv::{KvStore, MemoryBackend};
use chrono::{TimeZone, Utc};
use serde_json::json;

fn clock() -> MockClock {
    MockClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 3, 10, 7, 0).unwrap())
}

fn kv_store(clock: &MockClock, config: &StoreConfig) -> (KvStore, Arc<MemoryBackend>) {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    (KvStore::new(backend.clone(), clock, config), backend)
}

fn scheduler(store: &KvStore, clock: &MockClock, registry: HandlerRegistry) -> JobScheduler {
    let config = SchedulerConfig { node_id: "n1".into(), ..SchedulerConfig::default() };
    JobScheduler::new(
        Arc::new(store.clone()),
        StrategyRunner::from_config(&StrategyConfig::default(), clock.clone()).unwrap(),
        Arc::new(registry),
        config,
        Arc::new(clock.clone()),
    )
}

fn counting(name: &str, calls: &Arc<AtomicU32>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    let calls = Arc::clone(calls);
    registry.register_fn(name, move |_ctx| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("done"))
        }
    });
    registry
}

/// Validates a `*/15` job runs once per boundary through the KV store.
///
/// # Test Steps
/// 1. Register the job at 10:07 and check it is indexed for 10:15
/// 2. Advance 16 minutes and run pending work twice
/// 3. Verify one completed execution in history and the next run at 10:30
#[tokio::test]
async fn test_quarter_hour_job_over_kv_store() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(&store, &clock, counting("report", &calls));

    let job = Job::new("report", Schedule::cron("*/15 * * * *"))
        .with_target(JobRef::local("report"));
    scheduler.register(job).await.unwrap();
    assert!(store.get_due_jobs(clock.utc_now(), Some("default"), 10).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(16 * 60));
    assert_eq!(store.get_due_jobs(clock.utc_now(), Some("default"), 10).await.unwrap().len(), 1);
    let executions = scheduler.run_pending().await.unwrap();
    assert_eq!(executions.len(), 1);
    assert!(scheduler.run_pending().await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let job = store.get_job("report").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Idle);
    assert_eq!(job.next_run_at.unwrap().format("%H:%M").to_string(), "10:30");

    let history = store.get_executions("report", None, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Completed);
    assert_eq!(history[0].result, Some(json!("done")));
}

/// Validates exactly one of many concurrent owners gets a unique lock.
#[tokio::test]
async fn test_unique_lock_has_single_winner() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let key = unique_lock_key("etl");

    let attempts = (0..16).map(|i| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            store.acquire_unique_lock(&key, &format!("owner-{i}"), Duration::from_secs(30)).await
        })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| matches!(r, Ok(Ok(())))).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(StoreError::LockConflict { .. }))))
        .count();
    assert_eq!((winners, conflicts), (1, 15));
}

/// Validates lock TTL, same-owner refresh and owner-checked release.
///
/// # Test Steps
/// 1. Acquire with a 1s TTL; a second owner conflicts and sees the holder
/// 2. Release as the wrong owner fails; refresh as the holder succeeds
/// 3. Advance past the TTL; the second owner acquires
#[tokio::test]
async fn test_unique_lock_expires_after_ttl() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let ttl = Duration::from_secs(1);

    store.acquire_unique_lock("unique:sync", "a", ttl).await.unwrap();
    match store.acquire_unique_lock("unique:sync", "b", ttl).await {
        Err(StoreError::LockConflict { owner, .. }) => assert_eq!(owner, "a"),
        other => panic!("expected lock conflict, got {other:?}"),
    }

    assert!(!store.release_unique_lock("unique:sync", "b").await.unwrap());
    store.acquire_unique_lock("unique:sync", "a", ttl).await.unwrap();

    clock.advance(Duration::from_millis(1_500));
    assert_eq!(store.lock_owner("unique:sync").await.unwrap(), None);
    store.acquire_unique_lock("unique:sync", "b", ttl).await.unwrap();
    assert_eq!(store.lock_owner("unique:sync").await.unwrap(), Some("b".to_string()));
}

/// Validates a silent execution is rescued and its unique lock released.
///
/// # Test Steps
/// 1. Claim a unique job without executing it
/// 2. Heartbeat from another node has no effect; the owner's heartbeat does
/// 3. Advance past the cutoff; the execution is rescued and events fire
#[tokio::test]
async fn test_stuck_execution_rescued_over_kv_store() {
    let clock = clock();
    let (store, backend) = kv_store(&clock, &StoreConfig::default());
    let mut events = store.subscribe();
    let mut wire = backend.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(&store, &clock, counting("etl", &calls));

    let job = Job::new("etl", Schedule::every(Duration::from_secs(60)))
        .with_target(JobRef::local("etl"))
        .unique();
    scheduler.register(job).await.unwrap();
    clock.advance(Duration::from_secs(60));
    let report = scheduler.tick().await.unwrap();
    let execution_id = report.claimed[0].execution.id;

    clock.advance(Duration::from_secs(30));
    store.record_heartbeat("etl", "n2", clock.utc_now()).await.unwrap();
    let execution = store.get_execution(execution_id).await.unwrap().unwrap();
    assert_ne!(execution.heartbeat_at, Some(clock.utc_now()));
    store.record_heartbeat("etl", "n1", clock.utc_now()).await.unwrap();
    let execution = store.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.heartbeat_at, Some(clock.utc_now()));

    let cutoff_ms = scheduler.config().stuck_cutoff_ms;
    clock.advance(Duration::from_millis(cutoff_ms - 1_000));
    assert!(scheduler.rescue_stuck().await.unwrap().is_empty());
    clock.advance(Duration::from_secs(2));
    let rescued = scheduler.rescue_stuck().await.unwrap();
    assert_eq!(rescued.len(), 1);
    assert_eq!(rescued[0].status, ExecutionStatus::Rescued);
    assert_eq!(store.lock_owner(&unique_lock_key("etl")).await.unwrap(), None);
    assert_eq!(store.get_job("etl").await.unwrap().unwrap().state, JobState::Idle);

    let again = store.mark_execution_rescued(execution_id, clock.utc_now()).await.unwrap();
    assert_eq!(again.completed_at, rescued[0].completed_at);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["job_registered", "job_started", "job_rescued"]);

    let mut published = Vec::new();
    while let Ok((channel, message)) = wire.try_recv() {
        assert_eq!(channel, "cadence:events");
        let event: JobEvent = serde_json::from_str(&message).unwrap();
        published.push(event.name());
    }
    assert_eq!(published, names);
}

/// Validates history is capped per job and newest executions are kept.
#[tokio::test]
async fn test_history_is_capped() {
    let clock = clock();
    let config = StoreConfig { max_history: 3, ..StoreConfig::default() };
    let (store, _) = kv_store(&clock, &config);

    let mut ids = Vec::new();
    for attempt in 0..5 {
        let mut execution = Execution::start("cleanup", "n1", attempt, clock.utc_now());
        store.record_execution_start(&execution).await.unwrap();
        clock.advance(Duration::from_secs(1));
        execution.complete(clock.utc_now(), None);
        store.record_execution_complete(&execution).await.unwrap();
        ids.push(execution.id);
    }

    let history = store.get_executions("cleanup", None, 10).await.unwrap();
    let kept: Vec<_> = history.iter().map(|e| e.id).collect();
    assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
    assert!(store.get_execution(ids[0]).await.unwrap().is_none());

    let since = history[1].started_at;
    assert_eq!(store.get_executions("cleanup", Some(since), 10).await.unwrap().len(), 2);
}

/// Validates pruning removes finished executions older than the cutoff only.
#[tokio::test]
async fn test_prune_keeps_running_and_recent_executions() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());

    let mut old = Execution::start("ingest", "n1", 0, clock.utc_now());
    old.fail(clock.utc_now(), "boom");
    store.record_execution_start(&old).await.unwrap();
    let running = Execution::start("ingest", "n1", 0, clock.utc_now());
    store.record_execution_start(&running).await.unwrap();

    clock.advance(Duration::from_secs(3600));
    let recent = Execution::start("ingest", "n1", 0, clock.utc_now());
    store.record_execution_start(&recent).await.unwrap();

    let pruned = store.prune_executions(clock.utc_now(), 100).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(store.get_execution(old.id).await.unwrap().is_none());
    assert!(store.get_execution(running.id).await.unwrap().is_some());
    assert_eq!(store.get_executions("ingest", None, 10).await.unwrap().len(), 2);
}

/// Validates moving a job between queues and deleting it keeps the due
/// index consistent.
#[tokio::test]
async fn test_due_index_follows_queue_and_deletion() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let now = clock.utc_now();

    let mut job = Job::new("mail", Schedule::every(Duration::from_secs(60)));
    job.next_run_at = Some(now);
    store.register_job(&job).await.unwrap();
    assert_eq!(store.get_due_jobs(now, Some("default"), 10).await.unwrap().len(), 1);

    let moved = job.clone().with_queue("priority");
    store.update_job(&moved).await.unwrap();
    assert!(store.get_due_jobs(now, Some("default"), 10).await.unwrap().is_empty());
    assert_eq!(store.get_due_jobs(now, Some("priority"), 10).await.unwrap().len(), 1);
    assert_eq!(store.list_jobs(Some("priority")).await.unwrap().len(), 1);

    assert!(store.delete_job("mail").await.unwrap());
    assert!(!store.delete_job("mail").await.unwrap());
    assert!(store.get_due_jobs(now, Some("priority"), 10).await.unwrap().is_empty());
    assert!(matches!(
        store.update_job(&moved).await,
        Err(StoreError::JobNotFound(name)) if name == "mail"
    ));
}

/// Validates due jobs come back in priority order, lower value first.
#[tokio::test]
async fn test_due_jobs_ordered_by_priority() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let now = clock.utc_now();

    for (name, priority) in [("low", 10), ("high", -5), ("mid", 0)] {
        let mut job = Job::new(name, Schedule::every(Duration::from_secs(60)))
            .with_priority(priority);
        job.next_run_at = Some(now);
        store.register_job(&job).await.unwrap();
    }

    let due = store.get_due_jobs(now, Some("default"), 2).await.unwrap();
    let names: Vec<_> = due.iter().map(|job| job.name.as_str()).collect();
    assert_eq!(names, vec!["high", "mid"]);
}

/// Validates a high-priority job is found even when many earlier
/// low-priority jobs are due, across every queue when none is named.
///
/// # Test Steps
/// 1. Register fifty low-priority jobs due an hour ago on `default`
/// 2. Register one urgent job due now on `billing`
/// 3. Verify the all-queue read with a limit of one returns the urgent job
/// 4. Lower the urgent job's priority and verify it leaves the front
#[tokio::test]
async fn test_due_jobs_prefer_priority_over_age_across_queues() {
    let clock = clock();
    let (store, _) = kv_store(&clock, &StoreConfig::default());
    let now = clock.utc_now();

    for i in 0..50 {
        let mut job = Job::new(format!("bulk-{i}"), Schedule::every(Duration::from_secs(60)))
            .with_priority(5);
        job.next_run_at = Some(now - chrono::Duration::hours(1));
        store.register_job(&job).await.unwrap();
    }
    let mut urgent = Job::new("urgent", Schedule::every(Duration::from_secs(60)))
        .with_queue("billing")
        .with_priority(-1);
    urgent.next_run_at = Some(now);
    store.register_job(&urgent).await.unwrap();

    let due = store.get_due_jobs(now, None, 1).await.unwrap();
    assert_eq!(due[0].name, "urgent");
    assert_eq!(store.get_due_jobs(now, None, 100).await.unwrap().len(), 51);
    assert_eq!(store.get_due_jobs(now, Some("billing"), 100).await.unwrap().len(), 1);

    store.update_job(&urgent.clone().with_priority(9)).await.unwrap();
    let due = store.get_due_jobs(now, None, 1).await.unwrap();
    assert_eq!(due[0].name, "bulk-0");
    let billing = store.get_due_jobs(now, Some("billing"), 10).await.unwrap();
    assert_eq!(billing.len(), 1);
    assert_eq!(billing[0].priority, 9);
}
