//! Token bucket rate limiter
//!
//! A bucket holds up to `capacity` tokens and gains `refill_amount` tokens
//! every whole `refill_interval`. Refills are anchored on the previous refill
//! instant rather than on the call time, so irregular polling does not drift
//! the schedule.
//!
//! Upstream APIs often report their own quota in response headers;
//! [`TokenBucket::sync_from_headers`] overwrites the local view with those
//! numbers so the bucket never admits calls the upstream will reject.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circuit_breaker::{duration_millis, ConfigError, ConfigResult};
use crate::time::{Clock, SystemClock};

/// Configuration for a token bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: u64,
    /// Number of tokens to refill per interval
    pub refill_amount: u64,
    /// Time interval for token refill
    #[serde(with = "duration_millis", rename = "refill_interval_ms")]
    pub refill_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { capacity: 100, refill_amount: 10, refill_interval: Duration::from_secs(1) }
    }
}

impl TokenBucketConfig {
    pub fn new(capacity: u64, refill_amount: u64, refill_interval: Duration) -> Self {
        Self { capacity, refill_amount, refill_interval }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid { message: "capacity must be greater than 0".into() });
        }
        if self.refill_amount == 0 {
            return Err(ConfigError::Invalid {
                message: "refill_amount must be greater than 0".into(),
            });
        }
        if self.refill_interval.is_zero() {
            return Err(ConfigError::Invalid {
                message: "refill_interval must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Token bucket driven through `&mut self`
#[derive(Debug, Clone)]
pub struct TokenBucket<C: Clock = SystemClock> {
    config: TokenBucketConfig,
    tokens: u64,
    last_refill: Instant,
    /// Upstream told us the quota is exhausted until this instant
    blocked_until: Option<Instant>,
    clock: C,
}

impl TokenBucket<SystemClock> {
    /// Create a token bucket on the system clock
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a full token bucket with a custom clock
    pub fn with_clock(config: TokenBucketConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            tokens: config.capacity,
            last_refill: clock.now(),
            blocked_until: None,
            config,
            clock,
        })
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn refill(&mut self) {
        let now = self.clock.now();

        if let Some(until) = self.blocked_until {
            if now < until {
                return;
            }
            self.blocked_until = None;
            self.tokens = self.config.capacity;
            self.last_refill = now;
            return;
        }

        let interval_ms = self.config.refill_interval.as_millis().max(1);
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis();
        let refills = elapsed_ms / interval_ms;
        if refills == 0 {
            return;
        }

        let refill_count = u64::try_from(refills).unwrap_or(u64::MAX);
        let added = refill_count.saturating_mul(self.config.refill_amount);
        self.tokens = self.tokens.saturating_add(added).min(self.config.capacity);
        let advanced_ms = u64::try_from(refills * interval_ms).unwrap_or(u64::MAX);
        self.last_refill += Duration::from_millis(advanced_ms);
        debug!(added, tokens = self.tokens, "token_bucket.refilled");
    }

    /// Take one token, or report how long until one is available
    pub fn acquire(&mut self) -> Result<(), Duration> {
        if self.try_acquire(1) {
            Ok(())
        } else {
            Err(self.retry_after())
        }
    }

    /// Take `tokens` tokens if that many are available
    pub fn try_acquire(&mut self, tokens: u64) -> bool {
        self.refill();
        if self.tokens < tokens {
            debug!(available = self.tokens, requested = tokens, "token_bucket.insufficient");
            return false;
        }
        self.tokens -= tokens;
        true
    }

    /// Whether a token is available, without consuming it
    pub fn check(&mut self) -> bool {
        self.refill();
        self.tokens > 0
    }

    /// Tokens currently available
    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    /// Time until at least one token is available (zero if one is now)
    pub fn retry_after(&mut self) -> Duration {
        self.refill();
        let now = self.clock.now();
        if let Some(until) = self.blocked_until {
            return until.saturating_duration_since(now);
        }
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        let since_refill = now.saturating_duration_since(self.last_refill);
        self.config.refill_interval.saturating_sub(since_refill)
    }

    /// Overwrite local state with the quota an upstream API reported
    ///
    /// `limit` replaces the capacity when present. `remaining` becomes the
    /// token count. When `remaining` is zero and `reset_after` is given, the
    /// bucket stays empty until the upstream window resets, then refills to
    /// capacity.
    pub fn sync_from_headers(
        &mut self,
        limit: Option<u64>,
        remaining: u64,
        reset_after: Option<Duration>,
    ) {
        if let Some(limit) = limit.filter(|l| *l > 0) {
            self.config.capacity = limit;
        }
        self.tokens = remaining.min(self.config.capacity);
        let now = self.clock.now();
        self.last_refill = now;
        self.blocked_until = match reset_after {
            Some(reset) if remaining == 0 => Some(now + reset),
            _ => None,
        };
        debug!(
            capacity = self.config.capacity,
            tokens = self.tokens,
            "token_bucket.synced_from_headers"
        );
    }

    /// Reset the bucket to full capacity
    pub fn reset(&mut self) {
        self.tokens = self.config.capacity;
        self.last_refill = self.clock.now();
        self.blocked_until = None;
    }

    /// Whether the bucket is full and idle (safe to evict)
    pub fn is_full(&mut self) -> bool {
        self.refill();
        self.blocked_until.is_none() && self.tokens >= self.config.capacity
    }
}
