//! Named circuit breakers created on first use

use std::collections::HashMap;
use std::time::Duration;

use cadence_common::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Clock, SystemClock,
};
use cadence_domain::{CircuitSettings, StrategyConfig};
use tracing::{debug, info};

use super::error::{StrategyError, StrategyResult};
use super::ports::{CallOutcome, CircuitBreakerStrategy};

fn breaker_config(settings: &CircuitSettings) -> StrategyResult<CircuitBreakerConfig> {
    CircuitBreakerConfig::builder()
        .failure_threshold(settings.failure_threshold)
        .success_threshold(settings.success_threshold)
        .reset_timeout(Duration::from_millis(settings.reset_timeout_ms))
        .half_open_max_calls(settings.half_open_max_calls)
        .build()
        .map_err(|e| StrategyError::InvalidConfig(e.to_string()))
}

/// One breaker per circuit name
///
/// Breakers are cloned from validated, never-used templates, so creating
/// one cannot fail. Per-circuit overrides come from `strategy.circuits`.
pub struct CircuitRegistry<C: Clock + Clone = SystemClock> {
    default_template: CircuitBreaker<C>,
    templates: HashMap<String, CircuitBreaker<C>>,
    breakers: HashMap<String, CircuitBreaker<C>>,
}

impl<C: Clock + Clone> CircuitRegistry<C> {
    pub fn from_config(config: &StrategyConfig, clock: C) -> StrategyResult<Self> {
        let build = |settings: &CircuitSettings| -> StrategyResult<CircuitBreaker<C>> {
            CircuitBreaker::with_clock(breaker_config(settings)?, clock.clone())
                .map_err(|e| StrategyError::InvalidConfig(e.to_string()))
        };

        let default_template = build(&config.circuit_breaker)?;
        let templates = config
            .circuits
            .iter()
            .map(|(name, settings)| Ok((name.clone(), build(settings)?)))
            .collect::<StrategyResult<HashMap<_, _>>>()?;

        Ok(Self { default_template, templates, breakers: HashMap::new() })
    }

    fn breaker(&mut self, circuit: &str) -> &mut CircuitBreaker<C> {
        let templates = &self.templates;
        let default_template = &self.default_template;
        self.breakers
            .entry(circuit.to_string())
            .or_insert_with(|| templates.get(circuit).unwrap_or(default_template).clone())
    }

    /// Number of breakers currently tracked
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl<C: Clock + Clone> CircuitBreakerStrategy for CircuitRegistry<C> {
    fn allow(&mut self, circuit: &str) -> StrategyResult<()> {
        let breaker = self.breaker(circuit);
        if breaker.try_acquire() {
            Ok(())
        } else {
            Err(StrategyError::CircuitOpen {
                circuit: circuit.to_string(),
                retry_after: breaker.retry_after(),
            })
        }
    }

    fn release(&mut self, circuit: &str) {
        if let Some(breaker) = self.breakers.get_mut(circuit) {
            breaker.release();
        }
    }

    fn record(&mut self, circuit: &str, outcome: CallOutcome) {
        let breaker = self.breaker(circuit);
        let before = breaker.peek_state();
        match outcome {
            CallOutcome::Success => breaker.record_success(),
            CallOutcome::Failure => breaker.record_failure(),
            CallOutcome::Neutral => breaker.release(),
        }
        let after = breaker.peek_state();
        if before != after {
            info!(circuit, from = %before, to = %after, "circuit.transition");
        }
    }

    fn snapshot(&mut self, circuit: &str) -> CircuitSnapshot {
        self.breaker(circuit).snapshot()
    }

    fn reset(&mut self, circuit: &str) {
        self.breaker(circuit).reset();
    }

    /// Forget healthy breakers; a fresh one is equivalent
    fn tick(&mut self) {
        let before = self.breakers.len();
        self.breakers.retain(|_, breaker| {
            let snapshot = breaker.snapshot();
            snapshot.state != CircuitState::Closed || snapshot.failure_count > 0
        });
        let evicted = before - self.breakers.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.breakers.len(), "circuit.evicted_idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::MockClock;

    use super::*;

    fn registry(clock: &MockClock) -> CircuitRegistry<MockClock> {
        let mut config = StrategyConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.reset_timeout_ms = 1_000;
        config.circuits.insert(
            "fragile".into(),
            CircuitSettings { failure_threshold: 1, ..config.circuit_breaker },
        );
        CircuitRegistry::from_config(&config, clock.clone()).unwrap()
    }

    #[test]
    fn test_circuits_are_independent() {
        let clock = MockClock::new();
        let mut registry = registry(&clock);

        registry.record("crm", CallOutcome::Failure);
        registry.record("crm", CallOutcome::Failure);
        assert!(matches!(registry.allow("crm"), Err(StrategyError::CircuitOpen { .. })));
        assert!(registry.allow("billing").is_ok());
    }

    #[test]
    fn test_override_applies_per_name() {
        let clock = MockClock::new();
        let mut registry = registry(&clock);
        registry.record("fragile", CallOutcome::Failure);
        assert_eq!(registry.snapshot("fragile").state, CircuitState::Open);

        clock.advance(Duration::from_millis(1_000));
        assert!(registry.allow("fragile").is_ok());
        registry.record("fragile", CallOutcome::Success);
        assert_eq!(registry.snapshot("fragile").state, CircuitState::Closed);
    }

    #[test]
    fn test_neutral_outcome_does_not_count() {
        let clock = MockClock::new();
        let mut registry = registry(&clock);
        for _ in 0..5 {
            registry.record("crm", CallOutcome::Neutral);
        }
        assert_eq!(registry.snapshot("crm").state, CircuitState::Closed);
    }

    #[test]
    fn test_tick_evicts_only_healthy_breakers() {
        let clock = MockClock::new();
        let mut registry = registry(&clock);
        assert!(registry.allow("healthy").is_ok());
        registry.record("healthy", CallOutcome::Success);
        registry.record("flaky", CallOutcome::Failure);

        registry.tick();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot("flaky").failure_count, 1);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut config = StrategyConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let err = CircuitRegistry::from_config(&config, MockClock::new()).err().unwrap();
        assert!(matches!(err, StrategyError::InvalidConfig(_)));
    }
}
