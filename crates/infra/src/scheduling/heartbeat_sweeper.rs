//! Periodic rescue of crashed executions
//!
//! A node that dies mid-execution stops heartbeating. The sweeper finds
//! executions silent for longer than `stuck_cutoff_ms`, marks them rescued
//! and releases their locks so the job runs again. It also prunes finished
//! execution history past its maximum age.

use std::time::Duration;

use cadence_core::scheduler::{JobScheduler, SchedulerResult};
use cadence_domain::Execution;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::task::BackgroundTask;

/// Executions pruned per sweep
const PRUNE_BATCH: usize = 1_000;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub rescued: Vec<Execution>,
    pub pruned: usize,
}

#[derive(Clone)]
struct Sweep {
    scheduler: JobScheduler,
    history_max_age: Option<Duration>,
}

impl Sweep {
    async fn run(&self) -> SchedulerResult<SweepReport> {
        let rescued = self.scheduler.rescue_stuck().await?;
        let pruned = match self.history_max_age {
            Some(max_age) => self.scheduler.prune_history(max_age, PRUNE_BATCH).await?,
            None => 0,
        };
        if !rescued.is_empty() || pruned > 0 {
            info!(rescued = rescued.len(), pruned, "sweeper.swept");
        }
        Ok(SweepReport { rescued, pruned })
    }
}

/// Background sweep of stuck executions
pub struct HeartbeatSweeper {
    sweep: Sweep,
    task: BackgroundTask,
}

impl HeartbeatSweeper {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self {
            sweep: Sweep { scheduler, history_max_age: None },
            task: BackgroundTask::new("sweeper"),
        }
    }

    /// Also delete finished executions older than `max_age` on every sweep
    pub fn with_history_max_age(mut self, max_age: Duration) -> Self {
        self.sweep.history_max_age = Some(max_age);
        self
    }

    /// Run one sweep now
    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        self.sweep.run().await
    }

    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        let sweep = self.sweep.clone();
        let period = Duration::from_millis(sweep.scheduler.config().sweep_interval_ms.max(1));
        self.task.start(move |cancel| sweep_loop(sweep, period, cancel)).await?;
        info!(interval_ms = period.as_millis() as u64, "sweeper.started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        self.task.stop(JOIN_TIMEOUT).await?;
        info!("sweeper.stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn sweep_loop(sweep: Sweep, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; give live executions one period
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sweeper.loop_cancelled");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep.run().await {
                    error!(error = %err, "sweeper.sweep_failed");
                }
            }
        }
    }
}
