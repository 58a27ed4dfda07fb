//! Token-bucket rate limits per scope and key
//!
//! A scope names a rule (`strategy.rate_limits`); the key partitions it, e.g.
//! one bucket per tenant. Scopes without a rule are unlimited unless an
//! upstream reported a quota for them.

use std::collections::HashMap;
use std::time::Duration;

use cadence_common::{Clock, SystemClock, TokenBucket, TokenBucketConfig};
use cadence_domain::{RateLimitRule, StrategyConfig};
use tracing::{debug, warn};

use super::error::{StrategyError, StrategyResult};
use super::ports::RateLimiterStrategy;

fn bucket_config(rule: &RateLimitRule) -> TokenBucketConfig {
    TokenBucketConfig::new(
        rule.capacity,
        rule.refill_rate,
        Duration::from_millis(rule.refill_interval_ms),
    )
}

pub struct TokenBucketLimiter<C: Clock + Clone = SystemClock> {
    templates: HashMap<String, TokenBucket<C>>,
    buckets: HashMap<(String, String), TokenBucket<C>>,
    clock: C,
}

impl<C: Clock + Clone> TokenBucketLimiter<C> {
    pub fn from_config(config: &StrategyConfig, clock: C) -> StrategyResult<Self> {
        let templates = config
            .rate_limits
            .iter()
            .map(|(scope, rule)| {
                let bucket = TokenBucket::with_clock(bucket_config(rule), clock.clone())
                    .map_err(|e| StrategyError::InvalidConfig(format!("{scope}: {e}")))?;
                Ok((scope.clone(), bucket))
            })
            .collect::<StrategyResult<HashMap<_, _>>>()?;

        Ok(Self { templates, buckets: HashMap::new(), clock })
    }

    fn bucket(&mut self, scope: &str, key: &str) -> Option<&mut TokenBucket<C>> {
        let id = (scope.to_string(), key.to_string());
        if !self.buckets.contains_key(&id) {
            let mut bucket = self.templates.get(scope)?.clone();
            bucket.reset();
            self.buckets.insert(id.clone(), bucket);
        }
        self.buckets.get_mut(&id)
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl<C: Clock + Clone> RateLimiterStrategy for TokenBucketLimiter<C> {
    fn acquire(&mut self, scope: &str, key: &str) -> StrategyResult<()> {
        let Some(bucket) = self.bucket(scope, key) else {
            return Ok(());
        };
        bucket.acquire().map_err(|retry_after| {
            debug!(
                scope,
                key,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate_limit.denied"
            );
            StrategyError::RateLimited { scope: scope.to_string(), retry_after }
        })
    }

    fn check(&mut self, scope: &str, key: &str) -> bool {
        self.bucket(scope, key).map_or(true, |bucket| bucket.check())
    }

    fn sync_from_headers(
        &mut self,
        scope: &str,
        key: &str,
        limit: Option<u64>,
        remaining: u64,
        reset_after: Option<Duration>,
    ) {
        if let Some(bucket) = self.bucket(scope, key) {
            bucket.sync_from_headers(limit, remaining, reset_after);
            return;
        }

        // No local rule: adopt the upstream window as the rule
        let capacity = limit.unwrap_or(remaining).max(1);
        let window = reset_after.filter(|d| !d.is_zero()).unwrap_or(Duration::from_secs(1));
        let config = TokenBucketConfig::new(capacity, capacity, window);
        match TokenBucket::with_clock(config, self.clock.clone()) {
            Ok(mut bucket) => {
                bucket.sync_from_headers(limit, remaining, reset_after);
                self.buckets.insert((scope.to_string(), key.to_string()), bucket);
            }
            Err(err) => warn!(scope, key, error = %err, "rate_limit.sync_ignored"),
        }
    }

    /// Drop buckets that have refilled completely
    fn tick(&mut self) {
        self.buckets.retain(|_, bucket| !bucket.is_full());
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::MockClock;

    use super::*;

    fn limiter(clock: &MockClock) -> TokenBucketLimiter<MockClock> {
        let mut config = StrategyConfig::default();
        config.rate_limits.insert(
            "crm".into(),
            RateLimitRule { capacity: 2, refill_rate: 1, refill_interval_ms: 1_000 },
        );
        TokenBucketLimiter::from_config(&config, clock.clone()).unwrap()
    }

    #[test]
    fn test_unlimited_scope_always_passes() {
        let clock = MockClock::new();
        let mut limiter = limiter(&clock);
        for _ in 0..100 {
            assert!(limiter.acquire("search", "any").is_ok());
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_keys_have_separate_buckets() {
        let clock = MockClock::new();
        let mut limiter = limiter(&clock);

        assert!(limiter.acquire("crm", "tenant-a").is_ok());
        assert!(limiter.acquire("crm", "tenant-a").is_ok());
        let err = limiter.acquire("crm", "tenant-a").unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        assert!(limiter.acquire("crm", "tenant-b").is_ok());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire("crm", "tenant-a").is_ok());
    }

    #[test]
    fn test_headers_block_until_reset() {
        let clock = MockClock::new();
        let mut limiter = limiter(&clock);

        limiter.sync_from_headers("crm", "tenant-a", Some(50), 0, Some(Duration::from_secs(30)));
        assert!(!limiter.check("crm", "tenant-a"));

        clock.advance(Duration::from_secs(30));
        assert!(limiter.check("crm", "tenant-a"));
    }

    #[test]
    fn test_headers_create_bucket_for_unknown_scope() {
        let clock = MockClock::new();
        let mut limiter = limiter(&clock);

        limiter.sync_from_headers("github", "org", Some(5000), 0, Some(Duration::from_secs(60)));
        assert!(matches!(
            limiter.acquire("github", "org"),
            Err(StrategyError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_tick_drops_refilled_buckets() {
        let clock = MockClock::new();
        let mut limiter = limiter(&clock);
        assert!(limiter.acquire("crm", "a").is_ok());
        assert!(limiter.acquire("crm", "b").is_ok());
        assert!(limiter.acquire("crm", "b").is_ok());
        assert_eq!(limiter.len(), 2);

        clock.advance(Duration::from_secs(1));
        limiter.tick();
        // "a" is back to capacity, "b" still has one token missing
        assert_eq!(limiter.len(), 1);
    }
}
