//! Runtime loop for job scheduling
//!
//! Wraps a [`JobScheduler`] with explicit lifecycle management: `start` runs
//! `@reboot` jobs' boot hook and spawns a poll loop that ticks every
//! `poll_interval_ms`, executing each claimed instance on its own task;
//! `stop` cancels the loop and gives in-flight executions a grace period to
//! finish.
//!
//! # Example
//!
//! ```no_run
//! use cadence_core::scheduler::{JobScheduler, SchedulerError};
//! use cadence_infra::scheduling::SchedulerService;
//!
//! # async fn example(scheduler: JobScheduler) -> Result<(), SchedulerError> {
//! let mut service = SchedulerService::new(scheduler);
//! service.start().await?;
//! // ... application runs ...
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use cadence_core::scheduler::{JobScheduler, SchedulerError, SchedulerResult};
use cadence_domain::Execution;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::task::BackgroundTask;

/// Default time in-flight executions get to finish after `stop`
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Extra time allowed for the loop itself to return after the grace period
const JOIN_MARGIN: Duration = Duration::from_secs(5);

/// Poll loop driving a [`JobScheduler`]
pub struct SchedulerService {
    scheduler: JobScheduler,
    shutdown_grace: Duration,
    task: BackgroundTask,
}

impl SchedulerService {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self {
            scheduler,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            task: BackgroundTask::new("scheduler"),
        }
    }

    /// How long `stop` waits for running executions before aborting them
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Queue `@reboot` jobs and spawn the poll loop
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the loop is active, or the store error
    /// raised while queueing boot jobs.
    #[instrument(skip(self), fields(node = %self.scheduler.config().node_id))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.task.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let booted = self.scheduler.on_boot().await?;
        let scheduler = self.scheduler.clone();
        let grace = self.shutdown_grace;
        self.task.start(move |cancel| poll_loop(scheduler, grace, cancel)).await?;

        info!(
            booted,
            poll_interval_ms = self.scheduler.config().poll_interval_ms,
            queues = ?self.scheduler.config().queues,
            "scheduler.started"
        );
        Ok(())
    }

    /// Stop claiming work and wait for in-flight executions
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the loop is not active and `Timeout` if it
    /// does not return in time.
    #[instrument(skip(self), fields(node = %self.scheduler.config().node_id))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        self.task.stop(self.shutdown_grace + JOIN_MARGIN).await?;
        info!("scheduler.stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn poll_loop(scheduler: JobScheduler, grace: Duration, cancel: CancellationToken) {
    let period = Duration::from_millis(scheduler.config().poll_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: JoinSet<SchedulerResult<Execution>> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("scheduler.loop_cancelled");
                break;
            }
            _ = ticker.tick() => {
                match scheduler.tick().await {
                    Ok(report) => {
                        for claimed in report.claimed {
                            let scheduler = scheduler.clone();
                            in_flight.spawn(async move { scheduler.execute(claimed).await });
                        }
                    }
                    // the next tick retries
                    Err(err) => error!(error = %err, "scheduler.tick_failed"),
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_joined(joined),
        }
    }

    drain(in_flight, grace).await;
}

async fn drain(mut in_flight: JoinSet<SchedulerResult<Execution>>, grace: Duration) {
    if in_flight.is_empty() {
        return;
    }
    info!(in_flight = in_flight.len(), "scheduler.draining");

    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = in_flight.join_next() => match joined {
                Some(joined) => log_joined(joined),
                None => return,
            },
            _ = &mut deadline => {
                // Aborted executions keep their job active until the sweeper
                // rescues them
                warn!(aborted = in_flight.len(), "scheduler.shutdown_grace_elapsed");
                in_flight.shutdown().await;
                return;
            }
        }
    }
}

fn log_joined(joined: Result<SchedulerResult<Execution>, JoinError>) {
    match joined {
        Ok(Ok(execution)) => debug!(
            job = %execution.job_name,
            execution_id = %execution.id,
            status = ?execution.status,
            "scheduler.execution_finished"
        ),
        Ok(Err(err)) => error!(error = %err, "scheduler.execution_failed"),
        Err(err) => error!(error = %err, "scheduler.execution_panicked"),
    }
}
