//! Configuration management
//!
//! Every section deserializes with defaults, so a config file only needs the
//! keys it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::errors::{CadenceError, Result};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub strategy: StrategyConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CadenceError::Config(msg.to_string()));

        if self.scheduler.node_id.trim().is_empty() {
            return invalid("scheduler.node_id must not be empty");
        }
        if self.scheduler.poll_interval_ms == 0 {
            return invalid("scheduler.poll_interval_ms must be greater than 0");
        }
        if self.scheduler.queues.is_empty() {
            return invalid("scheduler.queues must name at least one queue");
        }
        if self.scheduler.stuck_cutoff_ms <= self.scheduler.heartbeat_interval_ms {
            return invalid("scheduler.stuck_cutoff_ms must exceed heartbeat_interval_ms");
        }
        if self.store.max_history == 0 {
            return invalid("store.max_history must be greater than 0");
        }
        if self.workflow.max_concurrency == 0 {
            return invalid("workflow.max_concurrency must be greater than 0");
        }
        self.strategy.circuit_breaker.validate("strategy.circuit_breaker")?;
        for (name, circuit) in &self.strategy.circuits {
            circuit.validate(&format!("strategy.circuits.{name}"))?;
        }
        for (scope, rule) in &self.strategy.rate_limits {
            if rule.capacity == 0 || rule.refill_rate == 0 || rule.refill_interval_ms == 0 {
                return Err(CadenceError::Config(format!(
                    "strategy.rate_limits.{scope}: capacity, refill_rate and refill_interval_ms \
                     must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Scheduler loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identity of this worker; lock owner and execution `node`
    pub node_id: String,
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub queues: Vec<String>,
    /// Maximum due jobs claimed per queue per tick
    pub batch_limit: usize,
    pub lock_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Heartbeats older than this mark an execution as stuck
    pub stuck_cutoff_ms: u64,
    pub sweep_interval_ms: u64,
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", std::process::id()),
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            queues: vec![DEFAULT_QUEUE.to_string()],
            batch_limit: DEFAULT_BATCH_LIMIT,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            stuck_cutoff_ms: DEFAULT_STUCK_CUTOFF_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Executions kept per job
    pub max_history: usize,
    pub history_max_age_secs: u64,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            history_max_age_secs: DEFAULT_HISTORY_MAX_AGE_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitSettings {
    fn validate(&self, path: &str) -> Result<()> {
        if self.failure_threshold == 0
            || self.success_threshold == 0
            || self.half_open_max_calls == 0
        {
            return Err(CadenceError::Config(format!(
                "{path}: thresholds and half_open_max_calls must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Token bucket rule for one rate-limit scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub capacity: u64,
    /// Tokens added per refill interval
    pub refill_rate: u64,
    pub refill_interval_ms: u64,
}

/// Retry behaviour of the default error classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Error messages containing any of these are never retried
    pub terminal_patterns: Vec<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            terminal_patterns: Vec::new(),
        }
    }
}

/// Strategy runner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Defaults for circuits without an override
    pub circuit_breaker: CircuitSettings,
    /// Per-circuit overrides
    pub circuits: BTreeMap<String, CircuitSettings>,
    /// Scope → rule; scopes without a rule are unlimited
    pub rate_limits: BTreeMap<String, RateLimitRule>,
    pub classifier: ClassifierSettings,
    pub tick_interval_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitSettings::default(),
            circuits: BTreeMap::new(),
            rate_limits: BTreeMap::new(),
            classifier: ClassifierSettings::default(),
            tick_interval_ms: DEFAULT_STRATEGY_TICK_MS,
        }
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_concurrency: usize,
    pub default_step_timeout_ms: u64,
    pub default_max_retries: u32,
    /// Deferrals (open circuit, rate limit) allowed per step before it fails
    pub max_deferrals: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_WORKFLOW_CONCURRENCY,
            default_step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"scheduler": {"node_id": "w1", "queues": ["a", "b"]},
                "strategy": {"rate_limits": {"api": {
                    "capacity": 10, "refill_rate": 1, "refill_interval_ms": 1000
                }}}}"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.node_id, "w1");
        assert_eq!(config.scheduler.queues, vec!["a", "b"]);
        assert_eq!(config.scheduler.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.strategy.rate_limits["api"].capacity, 10);
        assert_eq!(config.store.max_history, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.scheduler.queues.clear();
        assert!(matches!(config.validate(), Err(CadenceError::Config(_))));

        let mut config = Config::default();
        config.scheduler.stuck_cutoff_ms = config.scheduler.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let rule = RateLimitRule { capacity: 0, refill_rate: 1, refill_interval_ms: 1 };
        config.strategy.rate_limits.insert("api".into(), rule);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strategy.rate_limits.api"));
    }
}
