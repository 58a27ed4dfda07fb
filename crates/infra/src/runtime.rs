//! Runtime context - wires configuration into running services
//!
//! Builds the store, strategy runner, workflow engine and scheduler from one
//! [`Config`] and owns the background loops that drive them.

use std::sync::Arc;
use std::time::Duration;

use cadence_common::{Clock, SystemClock};
use cadence_core::{HandlerRegistry, JobScheduler, StrategyRunner, WorkflowEngine};
use cadence_domain::{CadenceError, Config, Result};
use tracing::{error, info};

use crate::kv::{KvBackend, KvStore, MemoryBackend};
use crate::scheduling::{HeartbeatSweeper, SchedulerService};

/// Time allowed for each background loop to come up
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds every service of one Cadence node
pub struct CadenceRuntime {
    config: Config,
    store: KvStore,
    strategy: StrategyRunner,
    engine: WorkflowEngine,
    scheduler: SchedulerService,
    sweeper: HeartbeatSweeper,
}

impl CadenceRuntime {
    /// Build a node backed by an in-process [`MemoryBackend`] and the
    /// system clock
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CadenceError::Config` if the configuration is invalid.
    pub fn in_memory(config: Config, registry: HandlerRegistry) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        Self::build(config, registry, backend, clock)
    }

    /// Build a node on an arbitrary backend and clock
    ///
    /// # Errors
    ///
    /// Returns `CadenceError::Config` if the configuration is invalid.
    pub fn build(
        config: Config,
        registry: HandlerRegistry,
        backend: Arc<dyn KvBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let store = KvStore::new(backend, clock.clone(), &config.store);
        let strategy = StrategyRunner::from_config(&config.strategy, clock.clone())?;
        let registry = Arc::new(registry);
        let shared: Arc<dyn cadence_core::Store> = Arc::new(store.clone());

        let engine = WorkflowEngine::new(
            shared.clone(),
            strategy.clone(),
            registry.clone(),
            config.workflow.clone(),
            clock.clone(),
        );
        let scheduler = JobScheduler::new(
            shared,
            strategy.clone(),
            registry,
            config.scheduler.clone(),
            clock,
        )
        .with_engine(engine.clone());

        let mut sweeper = HeartbeatSweeper::new(scheduler.clone());
        if config.store.history_max_age_secs > 0 {
            sweeper = sweeper
                .with_history_max_age(Duration::from_secs(config.store.history_max_age_secs));
        }

        Ok(Self {
            config,
            store,
            strategy,
            engine,
            scheduler: SchedulerService::new(scheduler),
            sweeper,
        })
    }

    /// Start the heartbeat sweeper and, when enabled, the poll loop
    ///
    /// # Errors
    ///
    /// Returns `CadenceError::Internal` if a loop fails or times out while
    /// starting.
    pub async fn start(&mut self) -> Result<()> {
        tokio::time::timeout(START_TIMEOUT, self.sweeper.start())
            .await
            .map_err(|_| start_timed_out("HeartbeatSweeper"))??;

        if self.config.scheduler.enabled {
            tokio::time::timeout(START_TIMEOUT, self.scheduler.start())
                .await
                .map_err(|_| start_timed_out("SchedulerService"))??;
        } else {
            info!(node = %self.config.scheduler.node_id, "runtime.scheduler_disabled");
        }

        info!(node = %self.config.scheduler.node_id, "runtime.started");
        Ok(())
    }

    /// Stop the loops and the strategy runner
    ///
    /// Loops that are not running are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while stopping a running loop.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;
        if self.scheduler.is_running() {
            if let Err(err) = self.scheduler.stop().await {
                error!(error = %err, "runtime.scheduler_stop_failed");
                first_error.get_or_insert(CadenceError::from(err));
            }
        }
        if self.sweeper.is_running() {
            if let Err(err) = self.sweeper.stop().await {
                error!(error = %err, "runtime.sweeper_stop_failed");
                first_error.get_or_insert(CadenceError::from(err));
            }
        }
        self.strategy.shutdown();
        info!(node = %self.config.scheduler.node_id, "runtime.stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &JobScheduler {
        self.scheduler.scheduler()
    }

    pub fn sweeper(&self) -> &HeartbeatSweeper {
        &self.sweeper
    }
}

fn start_timed_out(service: &str) -> CadenceError {
    error!(service, timeout_secs = START_TIMEOUT.as_secs(), "runtime.start_timed_out");
    CadenceError::Internal(format!(
        "{} start timed out after {}s",
        service,
        START_TIMEOUT.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.scheduler.queues.clear();

        let result = CadenceRuntime::in_memory(config, HandlerRegistry::new());
        assert!(matches!(result, Err(CadenceError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut runtime = CadenceRuntime::in_memory(Config::default(), HandlerRegistry::new())
            .expect("default config is valid");

        runtime.start().await.unwrap();
        assert!(runtime.sweeper().is_running());

        runtime.shutdown().await.unwrap();
        assert!(!runtime.sweeper().is_running());
    }

    #[tokio::test]
    async fn test_disabled_scheduler_is_not_started() {
        let mut config = Config::default();
        config.scheduler.enabled = false;
        let mut runtime = CadenceRuntime::in_memory(config, HandlerRegistry::new()).unwrap();

        runtime.start().await.unwrap();
        assert!(!runtime.scheduler.is_running());
        runtime.shutdown().await.unwrap();
    }
}
