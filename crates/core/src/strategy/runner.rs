//! Strategy runner
//!
//! A single task owns the circuit breakers, rate limiters and classifier.
//! Callers talk to it through a cloneable [`StrategyRunner`] handle; each
//! request carries a oneshot reply channel, so every call observes the
//! effects of the calls sent before it. A periodic tick gives each strategy a
//! chance to evict idle state.

use std::time::Duration;

use cadence_common::{CircuitSnapshot, Clock, CommonError};
use cadence_domain::constants::STRATEGY_MAILBOX_CAPACITY;
use cadence_domain::{RetryPolicy, StrategyConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::circuit::CircuitRegistry;
use super::classifier::{Classification, DefaultClassifier, NextAction};
use super::error::{StrategyError, StrategyResult};
use super::ports::{CallOutcome, CircuitBreakerStrategy, ErrorClassifier, RateLimiterStrategy};
use super::rate_limit::TokenBucketLimiter;

/// The strategy implementations a runner drives
pub struct Strategies {
    pub circuits: Box<dyn CircuitBreakerStrategy>,
    pub rate_limiter: Box<dyn RateLimiterStrategy>,
    pub classifier: Box<dyn ErrorClassifier>,
}

impl Strategies {
    /// Default implementations built from configuration
    pub fn from_config<C: Clock + Clone>(
        config: &StrategyConfig,
        clock: C,
    ) -> StrategyResult<Self> {
        Ok(Self {
            circuits: Box::new(CircuitRegistry::from_config(config, clock.clone())?),
            rate_limiter: Box::new(TokenBucketLimiter::from_config(config, clock)?),
            classifier: Box::new(DefaultClassifier::new(config.classifier.clone())),
        })
    }

    fn tick(&mut self) {
        self.circuits.tick();
        self.rate_limiter.tick();
        self.classifier.tick();
    }

    fn pre_execute(&mut self, circuit: &str, scope: Option<&str>, key: &str) -> StrategyResult<()> {
        self.circuits.allow(circuit)?;
        if let Some(scope) = scope {
            if let Err(err) = self.rate_limiter.acquire(scope, key) {
                self.circuits.release(circuit);
                return Err(err);
            }
        }
        Ok(())
    }

    fn record_result(&mut self, circuit: &str, error: Option<&CommonError>) {
        let outcome = match error {
            None => CallOutcome::Success,
            Some(err) if self.classifier.trips_circuit(err) => CallOutcome::Failure,
            Some(_) => CallOutcome::Neutral,
        };
        self.circuits.record(circuit, outcome);
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller gave up; nothing to do
        match command {
            Command::PreExecute { circuit, scope, key, reply } => {
                let _ = reply.send(self.pre_execute(&circuit, scope.as_deref(), &key));
            }
            Command::RecordResult { circuit, error, reply } => {
                self.record_result(&circuit, error.as_ref());
                let _ = reply.send(());
            }
            Command::Classify { error, reply } => {
                let _ = reply.send(self.classifier.classify(&error));
            }
            Command::NextAction { error, attempt, policy, reply } => {
                let _ = reply.send(self.classifier.next_action(&error, attempt, policy.as_ref()));
            }
            Command::TripsCircuit { error, reply } => {
                let _ = reply.send(self.classifier.trips_circuit(&error));
            }
            Command::CircuitState { circuit, reply } => {
                let _ = reply.send(self.circuits.snapshot(&circuit));
            }
            Command::ResetCircuit { circuit, reply } => {
                self.circuits.reset(&circuit);
                let _ = reply.send(());
            }
            Command::CheckRateLimit { scope, key, reply } => {
                let _ = reply.send(self.rate_limiter.check(&scope, &key));
            }
            Command::SyncRateLimit { scope, key, limit, remaining, reset_after, reply } => {
                self.rate_limiter.sync_from_headers(&scope, &key, limit, remaining, reset_after);
                let _ = reply.send(());
            }
            Command::Tick { reply } => {
                self.tick();
                let _ = reply.send(());
            }
        }
    }
}

enum Command {
    PreExecute {
        circuit: String,
        scope: Option<String>,
        key: String,
        reply: oneshot::Sender<StrategyResult<()>>,
    },
    RecordResult {
        circuit: String,
        error: Option<CommonError>,
        reply: oneshot::Sender<()>,
    },
    Classify {
        error: CommonError,
        reply: oneshot::Sender<Classification>,
    },
    NextAction {
        error: CommonError,
        attempt: u32,
        policy: Option<RetryPolicy>,
        reply: oneshot::Sender<NextAction>,
    },
    TripsCircuit {
        error: CommonError,
        reply: oneshot::Sender<bool>,
    },
    CircuitState {
        circuit: String,
        reply: oneshot::Sender<CircuitSnapshot>,
    },
    ResetCircuit {
        circuit: String,
        reply: oneshot::Sender<()>,
    },
    CheckRateLimit {
        scope: String,
        key: String,
        reply: oneshot::Sender<bool>,
    },
    SyncRateLimit {
        scope: String,
        key: String,
        limit: Option<u64>,
        remaining: u64,
        reset_after: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the strategy task
#[derive(Clone)]
pub struct StrategyRunner {
    sender: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl StrategyRunner {
    /// Spawn the runner task on the current Tokio runtime
    pub fn spawn(strategies: Strategies, tick_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(STRATEGY_MAILBOX_CAPACITY);
        let shutdown = CancellationToken::new();
        tokio::spawn(run(strategies, receiver, tick_interval, shutdown.clone()));
        Self { sender, shutdown }
    }

    /// Spawn a runner with the default strategies
    pub fn from_config<C: Clock + Clone>(
        config: &StrategyConfig,
        clock: C,
    ) -> StrategyResult<Self> {
        let strategies = Strategies::from_config(config, clock)?;
        Ok(Self::spawn(strategies, Duration::from_millis(config.tick_interval_ms.max(1))))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> StrategyResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender.send(build(reply)).await.map_err(|_| StrategyError::Unavailable)?;
        response.await.map_err(|_| StrategyError::Unavailable)
    }

    /// Gate one call: circuit first, then the rate limit for `scope`/`key`
    ///
    /// Fails with `CircuitOpen` or `RateLimited` when the call should be
    /// deferred. A call refused by the rate limiter does not hold a half-open
    /// probe slot.
    pub async fn pre_execute_check(
        &self,
        circuit: &str,
        scope: Option<&str>,
        key: &str,
    ) -> StrategyResult<()> {
        let circuit = circuit.to_string();
        let scope = scope.map(str::to_string);
        let key = key.to_string();
        self.request(|reply| Command::PreExecute { circuit, scope, key, reply }).await?
    }

    /// Report how a gated call ended
    ///
    /// Failures only count against the circuit when the classifier says they
    /// trip it.
    pub async fn record_result(
        &self,
        circuit: &str,
        outcome: Result<(), &CommonError>,
    ) -> StrategyResult<()> {
        let circuit = circuit.to_string();
        let error = outcome.err().cloned();
        self.request(|reply| Command::RecordResult { circuit, error, reply }).await
    }

    pub async fn classify(&self, error: &CommonError) -> StrategyResult<Classification> {
        let error = error.clone();
        self.request(|reply| Command::Classify { error, reply }).await
    }

    /// Retry decision after `attempt` failed attempts
    pub async fn next_action(
        &self,
        error: &CommonError,
        attempt: u32,
        policy: Option<RetryPolicy>,
    ) -> StrategyResult<NextAction> {
        let error = error.clone();
        self.request(|reply| Command::NextAction { error, attempt, policy, reply }).await
    }

    pub async fn trips_circuit(&self, error: &CommonError) -> StrategyResult<bool> {
        let error = error.clone();
        self.request(|reply| Command::TripsCircuit { error, reply }).await
    }

    pub async fn circuit_state(&self, circuit: &str) -> StrategyResult<CircuitSnapshot> {
        let circuit = circuit.to_string();
        self.request(|reply| Command::CircuitState { circuit, reply }).await
    }

    pub async fn reset_circuit(&self, circuit: &str) -> StrategyResult<()> {
        let circuit = circuit.to_string();
        self.request(|reply| Command::ResetCircuit { circuit, reply }).await
    }

    /// Whether `scope`/`key` has a token available, without taking it
    pub async fn check_rate_limit(&self, scope: &str, key: &str) -> StrategyResult<bool> {
        let (scope, key) = (scope.to_string(), key.to_string());
        self.request(|reply| Command::CheckRateLimit { scope, key, reply }).await
    }

    /// Adopt quota headers from an upstream response
    pub async fn sync_rate_limit(
        &self,
        scope: &str,
        key: &str,
        limit: Option<u64>,
        remaining: u64,
        reset_after: Option<Duration>,
    ) -> StrategyResult<()> {
        let (scope, key) = (scope.to_string(), key.to_string());
        self.request(|reply| Command::SyncRateLimit {
            scope,
            key,
            limit,
            remaining,
            reset_after,
            reply,
        })
        .await
    }

    /// Run housekeeping now instead of waiting for the next tick
    pub async fn tick(&self) -> StrategyResult<()> {
        self.request(|reply| Command::Tick { reply }).await
    }

    /// Stop the runner task; later calls fail with `Unavailable`
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.sender.is_closed()
    }
}

async fn run(
    mut strategies: Strategies,
    mut receiver: mpsc::Receiver<Command>,
    tick_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    info!(tick_interval_ms = tick_interval.as_millis() as u64, "strategy_runner.started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            maybe_command = receiver.recv() => {
                match maybe_command {
                    Some(command) => strategies.handle(command),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                debug!("strategy_runner.tick");
                strategies.tick();
            }
        }
    }

    receiver.close();
    info!("strategy_runner.stopped");
}
