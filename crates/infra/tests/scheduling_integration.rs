//! Integration tests for the background scheduling loops
//!
//! The poll loop and the sweeper run on real Tokio time with short
//! intervals; job due times and heartbeat ages come from a mock clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Clock, MockClock};
use cadence_core::scheduler::{JobScheduler, SchedulerError};
use cadence_core::store::{ExecutionStore, JobStore};
use cadence_core::strategy::StrategyRunner;
use cadence_core::workflow::HandlerRegistry;
use cadence_domain::{
    ExecutionStatus, Job, JobRef, JobState, Schedule, SchedulerConfig, StoreConfig, StrategyConfig,
};
use cadence_infra::kv::{KvStore, MemoryBackend};
use cadence_infra::scheduling::{HeartbeatSweeper, SchedulerService};
use chrono::{TimeZone, Utc};
use serde_json::json;

fn clock() -> MockClock {
    MockClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 3, 10, 7, 0).unwrap())
}

fn node(clock: &MockClock, registry: HandlerRegistry) -> (JobScheduler, KvStore) {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let backend = Arc::new(MemoryBackend::new(shared.clone()));
    let store = KvStore::new(backend, shared.clone(), &StoreConfig::default());
    let config = SchedulerConfig {
        node_id: "n1".into(),
        poll_interval_ms: 10,
        sweep_interval_ms: 10,
        ..SchedulerConfig::default()
    };
    let scheduler = JobScheduler::new(
        Arc::new(store.clone()),
        StrategyRunner::from_config(&StrategyConfig::default(), clock.clone()).unwrap(),
        Arc::new(registry),
        config,
        shared,
    );
    (scheduler, store)
}

/// Poll `check` every 10ms until it holds or two seconds pass
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Validates the poll loop executes due jobs and boots `@reboot` jobs.
///
/// # Test Steps
/// 1. Register an interval job and a reboot job, then make the interval due
/// 2. Start the service and wait for both handlers to run
/// 3. Stop the service and verify it reports not running
#[tokio::test]
async fn test_service_runs_due_and_boot_jobs() {
    let clock = clock();
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::default();
    let counter = Arc::clone(&calls);
    registry.register_fn("count", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    });
    let (scheduler, store) = node(&clock, registry);

    let interval = Job::new("tick", Schedule::every(Duration::from_secs(60)))
        .with_target(JobRef::local("count"));
    let boot = Job::new("warm", Schedule::cron("@reboot")).with_target(JobRef::local("count"));
    scheduler.register(interval).await.unwrap();
    scheduler.register(boot).await.unwrap();
    clock.advance(Duration::from_secs(61));

    let mut service = SchedulerService::new(scheduler);
    service.start().await.unwrap();
    assert!(service.is_running());

    let store_ref = &store;
    let completed = eventually(|| async move {
        let tick = store_ref.get_job("tick").await.unwrap();
        let warm = store_ref.get_job("warm").await.unwrap();
        [tick, warm].iter().flatten().all(|job| job.run_count == 1 && !job.is_active())
    })
    .await;
    assert!(completed, "both jobs should run once");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let history = store.get_executions("tick", None, 10).await.unwrap();
    assert_eq!(history[0].status, ExecutionStatus::Completed);

    service.stop().await.unwrap();
    assert!(!service.is_running());
}

/// Validates start/stop misuse is reported instead of ignored.
#[tokio::test]
async fn test_service_lifecycle_errors() {
    let clock = clock();
    let (scheduler, _) = node(&clock, HandlerRegistry::default());
    let mut service = SchedulerService::new(scheduler);

    assert!(matches!(service.stop().await, Err(SchedulerError::NotRunning)));
    service.start().await.unwrap();
    assert!(matches!(service.start().await, Err(SchedulerError::AlreadyRunning)));
    service.stop().await.unwrap();

    // restartable after a clean stop
    service.start().await.unwrap();
    service.stop().await.unwrap();
}

/// Validates executions outliving the shutdown grace are aborted and later
/// rescued by the sweeper.
///
/// # Test Steps
/// 1. Start a job whose handler never finishes in time
/// 2. Stop with a short grace; the execution stays running in the store
/// 3. Advance the mock clock past the cutoff and sweep once
/// 4. Verify the execution is rescued and the job is idle again
#[tokio::test]
async fn test_aborted_execution_rescued_by_sweeper() {
    let clock = clock();
    let mut registry = HandlerRegistry::default();
    registry.register_fn("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!(null))
    });
    let (scheduler, store) = node(&clock, registry);

    let job = Job::new("export", Schedule::every(Duration::from_secs(60)))
        .with_target(JobRef::local("slow"))
        .unique();
    scheduler.register(job).await.unwrap();
    clock.advance(Duration::from_secs(60));

    let mut service =
        SchedulerService::new(scheduler.clone()).with_shutdown_grace(Duration::from_millis(50));
    service.start().await.unwrap();
    let store_ref = &store;
    let active = eventually(|| async move {
        store_ref.get_job("export").await.unwrap().is_some_and(|job| job.is_active())
    })
    .await;
    assert!(active, "job should be claimed by the poll loop");
    service.stop().await.unwrap();

    let running = store.get_executions("export", None, 10).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].status, ExecutionStatus::Running);

    let sweeper = HeartbeatSweeper::new(scheduler.clone());
    assert!(sweeper.sweep().await.unwrap().rescued.is_empty());

    clock.advance(Duration::from_millis(scheduler.config().stuck_cutoff_ms + 1_000));
    let report = sweeper.sweep().await.unwrap();
    assert_eq!(report.rescued.len(), 1);
    assert_eq!(report.rescued[0].id, running[0].id);

    let execution = store.get_execution(running[0].id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Rescued);
    assert_eq!(store.get_job("export").await.unwrap().unwrap().state, JobState::Idle);
}

/// Validates the sweeper loop rescues on its own and prunes old history.
#[tokio::test]
async fn test_sweeper_loop_rescues_and_prunes() {
    let clock = clock();
    let (scheduler, store) = node(&clock, HandlerRegistry::default());

    let job = Job::new("index", Schedule::every(Duration::from_secs(60)))
        .with_target(JobRef::local("missing"));
    scheduler.register(job).await.unwrap();
    clock.advance(Duration::from_secs(60));
    let report = scheduler.tick().await.unwrap();
    let execution_id = report.claimed[0].execution.id;
    clock.advance(Duration::from_millis(scheduler.config().stuck_cutoff_ms + 1_000));

    let mut sweeper = HeartbeatSweeper::new(scheduler.clone())
        .with_history_max_age(Duration::from_secs(24 * 60 * 60));
    sweeper.start().await.unwrap();
    assert!(matches!(sweeper.start().await, Err(SchedulerError::AlreadyRunning)));

    let store_ref = &store;
    let rescued = eventually(|| async move {
        store_ref
            .get_execution(execution_id)
            .await
            .unwrap()
            .is_some_and(|e| e.status == ExecutionStatus::Rescued)
    })
    .await;
    assert!(rescued, "sweeper loop should rescue the silent execution");

    clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
    let pruned = eventually(|| async move {
        store_ref.get_execution(execution_id).await.unwrap().is_none()
    })
    .await;
    assert!(pruned, "sweeper loop should prune expired history");

    sweeper.stop().await.unwrap();
    assert!(matches!(sweeper.stop().await, Err(SchedulerError::NotRunning)));
}
