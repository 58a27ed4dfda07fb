//! Backoff strategies and jitter for retry delays

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backoff strategy for calculating retry delays
///
/// `attempt` is 1-based: the delay before the first retry is
/// `calculate_delay(1)`.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry without waiting
    Immediate,
    /// Fixed delay between retries
    Fixed(Duration),
    /// `initial_delay + increment * (attempt - 1)`, capped at `max_delay`
    Linear { initial_delay: Duration, increment: Duration, max_delay: Duration },
    /// `initial_delay * base^(attempt - 1)`, capped at `max_delay`
    Exponential { initial_delay: Duration, base: f64, max_delay: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial_delay: Duration::from_secs(1),
            base: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay before retry number `attempt`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial_delay, increment, max_delay } => {
                initial_delay.saturating_add(increment.saturating_mul(step)).min(*max_delay)
            }
            BackoffStrategy::Exponential { initial_delay, base, max_delay } => {
                let exponent = step.min(i32::MAX as u32) as i32;
                let delay = initial_delay.as_millis() as f64 * base.powi(exponent);
                let delay_ms = delay.min(max_delay.as_millis() as f64).max(0.0) as u64;
                Duration::from_millis(delay_ms)
            }
        }
    }
}

/// Jitter type for adding randomness to retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter
    #[default]
    None,
    /// Full jitter: 0 to calculated_delay
    Full,
    /// Equal jitter: calculated_delay/2 to calculated_delay
    Equal,
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(random_value(delay_ms)),
            Jitter::Equal => {
                let half = delay_ms / 2;
                Duration::from_millis(half + random_value(delay_ms - half))
            }
        }
    }
}

/// Cheap pseudo-random value in `0..=max` seeded from the wall clock
fn random_value(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().subsec_nanos();
    // LCG constants from Numerical Recipes
    let mut seed = u64::from(nanos).wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    seed % (max + 1)
}
