//! Circuit breaker state machine
//!
//! `closed → open → half_open → closed`. The breaker is a plain value driven
//! through `&mut self`; callers that share one across tasks serialize access
//! themselves (the strategy runner owns its breakers inside a single actor).
//!
//! - In `closed`, `failure_threshold` consecutive failures open the circuit
//!   and stamp `opened_at`.
//! - In `open`, every call is rejected until `reset_timeout` has elapsed past
//!   `opened_at`; the next state read then moves to `half_open`.
//! - In `half_open`, at most `half_open_max_calls` probes may be in flight.
//!   `success_threshold` successes close the circuit, any failure re-opens it.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::time::{Clock, SystemClock};

/// Configuration validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` before opening the circuit
    pub failure_threshold: u64,
    /// Successes needed in `half_open` to close the circuit
    pub success_threshold: u64,
    /// Time to wait in `open` before probing
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Maximum probes in flight while `half_open`
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker, for inspection and status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub half_open_calls: u64,
    pub total_calls: u64,
    /// How long the circuit has been open, if it is
    pub open_for_ms: Option<u64>,
}

/// Single circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    half_open_calls: u64,
    total_calls: u64,
    opened_at: Option<Instant>,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    /// Create a circuit breaker on the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a circuit breaker with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            total_calls: 0,
            opened_at: None,
            clock,
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the `open → half_open` transition when the
    /// reset timeout has elapsed
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| self.clock.now().saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.reset_timeout {
                self.transition(CircuitState::HalfOpen);
            }
        }
        self.state
    }

    /// State as last recorded, without applying timers
    pub fn peek_state(&self) -> CircuitState {
        self.state
    }

    /// Ask permission to run one call
    ///
    /// Returns `false` while open, or while half-open with all probe slots in
    /// use. A granted half-open call occupies a probe slot until its result is
    /// recorded.
    pub fn try_acquire(&mut self) -> bool {
        let allowed = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            self.total_calls += 1;
        } else {
            debug!(state = %self.state, "circuit_breaker.rejected");
        }
        allowed
    }

    /// Remaining time before an open circuit will accept a probe
    pub fn retry_after(&self) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => {
                let elapsed = self.clock.now().saturating_duration_since(at);
                Some(self.config.reset_timeout.saturating_sub(elapsed))
            }
            _ => None,
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_calls = self.half_open_calls.saturating_sub(1);
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    info!(successes = self.success_count, "circuit_breaker.closed");
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                warn!("circuit_breaker.success_while_open");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(failures = self.failure_count, "circuit_breaker.opened");
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit_breaker.reopened");
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {
                self.failure_count += 1;
            }
        }
    }

    /// Give back a granted call that never ran
    ///
    /// Frees the half-open probe slot so a call refused further down the
    /// pipeline (e.g. by a rate limiter) does not hold the circuit half-open.
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
        self.total_calls = self.total_calls.saturating_sub(1);
    }

    /// Force the breaker back to `closed`
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed);
        info!("circuit_breaker.reset");
    }

    /// Snapshot for inspection
    pub fn snapshot(&mut self) -> CircuitSnapshot {
        let state = self.state();
        CircuitSnapshot {
            state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_calls: self.half_open_calls,
            total_calls: self.total_calls,
            open_for_ms: self
                .opened_at
                .filter(|_| state == CircuitState::Open)
                .map(|at| self.clock.now().saturating_duration_since(at).as_millis() as u64),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.success_count = 0;
        self.half_open_calls = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(self.clock.now());
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
