//! Domain constants
//!
//! Defaults shared by configuration, the store contract and the engines.

// Scheduling
pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_PRIORITY: i32 = 0;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BATCH_LIMIT: usize = 100;
pub const DEFAULT_LOCK_TTL_MS: u64 = 300_000;

// Heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_STUCK_CUTOFF_MS: u64 = 60_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

// Execution history
pub const DEFAULT_MAX_HISTORY: usize = 100;
pub const DEFAULT_HISTORY_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

// Retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 300_000;

// Workflows
pub const DEFAULT_WORKFLOW_CONCURRENCY: usize = 8;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_DEFERRALS: u32 = 50;

// Strategy runner
pub const DEFAULT_STRATEGY_TICK_MS: u64 = 60_000;
pub const STRATEGY_MAILBOX_CAPACITY: usize = 1_024;

// Notifications
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

// Key-value layout
pub const DEFAULT_KEY_PREFIX: &str = "cadence";
