//! Scheduled job definitions and runtime state

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workflow::JobRef;
use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_TIMEZONE,
};
use crate::impl_domain_status_conversions;

/// When a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Five-field cron text (or a macro such as `@hourly`) evaluated in an
    /// IANA time zone
    Cron { expression: String, timezone: String },
    /// Fixed interval anchored on the previous run
    Interval { every_ms: u64 },
    /// Once, when the scheduler starts
    Reboot,
}

impl Schedule {
    /// Cron schedule in UTC; `@reboot` becomes [`Schedule::Reboot`]
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::cron_in(expression, DEFAULT_TIMEZONE)
    }

    /// Cron schedule in the given time zone
    pub fn cron_in(expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        let expression = expression.into();
        if expression.trim().eq_ignore_ascii_case("@reboot") {
            return Self::Reboot;
        }
        Self::Cron { expression, timezone: timezone.into() }
    }

    /// Fixed-interval schedule
    pub fn every(interval: std::time::Duration) -> Self {
        Self::Interval { every_ms: interval.as_millis() as u64 }
    }

    pub fn is_reboot(&self) -> bool {
        matches!(self, Self::Reboot)
    }
}

/// Whether a job is currently executing somewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Active,
}

impl_domain_status_conversions!(JobState {
    Idle => "idle",
    Active => "active",
});

/// Shape of the delay curve between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Immediate,
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl_domain_status_conversions!(BackoffKind {
    Immediate => "immediate",
    Fixed => "fixed",
    Linear => "linear",
    Exponential => "exponential",
});

/// Retry delay policy shared by jobs and workflow steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Fixed, base_delay_ms: delay_ms, max_delay_ms: delay_ms }
    }

    pub fn immediate() -> Self {
        Self { kind: BackoffKind::Immediate, base_delay_ms: 0, max_delay_ms: 0 }
    }
}

/// A registered, scheduled unit of work
///
/// Keyed by `name`. Definition fields are set at registration; the runtime
/// fields below `tags` are maintained by the store as the job moves through
/// scheduling and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub schedule: Schedule,
    /// What to run; defaults to the local handler named like the job
    pub target: JobRef,
    pub queue: String,
    /// Lower runs first among jobs due at the same time
    pub priority: i32,
    /// At most one active execution system-wide
    pub unique: bool,
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Circuit consulted before each run; defaults to the job name
    pub circuit: Option<String>,
    /// Rate-limit scope consulted before each run
    pub rate_limit_scope: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
    /// Retry attempt of the current run cycle (0 when not retrying)
    #[serde(default)]
    pub attempt: u32,
    pub last_result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// New idle job with default settings
    pub fn new(name: impl Into<String>, schedule: Schedule) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            target: JobRef::local(name.clone()),
            name,
            schedule,
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            unique: false,
            timeout_ms: None,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            circuit: None,
            rate_limit_scope: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            state: JobState::Idle,
            run_count: 0,
            error_count: 0,
            attempt: 0,
            last_result: None,
            last_error: None,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_target(mut self, target: JobRef) -> Self {
        self.target = target;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_circuit(mut self, circuit: impl Into<String>) -> Self {
        self.circuit = Some(circuit.into());
        self
    }

    pub fn with_rate_limit_scope(mut self, scope: impl Into<String>) -> Self {
        self.rate_limit_scope = Some(scope.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Circuit name used for strategy checks
    pub fn circuit_name(&self) -> &str {
        self.circuit.as_deref().unwrap_or(&self.name)
    }

    pub fn is_active(&self) -> bool {
        self.state == JobState::Active
    }

    /// Due at `now` and not already running
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Idle && self.next_run_at.is_some_and(|at| at <= now)
    }
}
