//! Error classification and retry decisions

use std::time::Duration;

use cadence_common::{BackoffStrategy, CommonError, ErrorClassification, ErrorSeverity};
use cadence_domain::{BackoffKind, ClassifierSettings, RetryPolicy};
use serde::Serialize;

use super::ports::ErrorClassifier;

/// Broad failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Back-pressure from a limiter or breaker; retry after the hinted delay
    Retryable,
    /// Upstream hiccup such as a timeout or a 5xx
    Transient,
    /// Upstream answers but is impaired; retry slowly
    Degraded,
    /// Retrying cannot help
    Terminal,
    Unknown,
}

/// What the classifier concluded about one error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub class: ErrorClass,
    pub retryable: bool,
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub trips_circuit: bool,
    /// Minimum delay the error itself asked for
    pub retry_after: Option<Duration>,
    pub severity: ErrorSeverity,
}

/// Decision after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Retry { delay: Duration },
    DeadLetter,
    /// Drop the failure without keeping it
    Discard,
}

impl Classification {
    /// Apply a job or step retry policy
    pub fn with_policy(mut self, policy: &RetryPolicy) -> Self {
        self.max_retries = policy.max_retries;
        self.backoff = policy.backoff.kind;
        self.base_delay = Duration::from_millis(policy.backoff.base_delay_ms);
        let max_ms = policy.backoff.max_delay_ms.max(policy.backoff.base_delay_ms);
        self.max_delay = Duration::from_millis(max_ms);
        self
    }

    pub fn backoff_strategy(&self) -> BackoffStrategy {
        match self.backoff {
            BackoffKind::Immediate => BackoffStrategy::Immediate,
            BackoffKind::Fixed => BackoffStrategy::Fixed(self.base_delay),
            BackoffKind::Linear => BackoffStrategy::Linear {
                initial_delay: self.base_delay,
                increment: self.base_delay,
                max_delay: self.max_delay,
            },
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                initial_delay: self.base_delay,
                base: 2.0,
                max_delay: self.max_delay,
            },
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_strategy().calculate_delay(attempt);
        self.retry_after.map_or(backoff, |hint| hint.max(backoff))
    }

    /// Decide after `attempt` attempts have failed
    pub fn next_action(&self, attempt: u32) -> NextAction {
        if self.retryable && attempt <= self.max_retries {
            NextAction::Retry { delay: self.delay_for(attempt) }
        } else if !self.retryable && self.severity <= ErrorSeverity::Info {
            NextAction::Discard
        } else {
            NextAction::DeadLetter
        }
    }
}

/// Classifier driven by [`CommonError`] variants and configured patterns
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    settings: ClassifierSettings,
    patterns: Vec<String>,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self::new(ClassifierSettings::default())
    }
}

impl DefaultClassifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        let patterns = settings.terminal_patterns.iter().map(|p| p.to_lowercase()).collect();
        Self { settings, patterns }
    }

    fn matches_terminal_pattern(&self, error: &CommonError) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let message = error.to_string().to_lowercase();
        self.patterns.iter().any(|p| message.contains(p))
    }

    fn base(&self, class: ErrorClass, error: &CommonError) -> Classification {
        let retryable = !matches!(class, ErrorClass::Terminal | ErrorClass::Unknown);
        Classification {
            class,
            retryable,
            max_retries: if retryable { self.settings.max_retries } else { 0 },
            backoff: BackoffKind::Exponential,
            base_delay: Duration::from_millis(self.settings.base_delay_ms),
            max_delay: Duration::from_millis(self.settings.max_delay_ms),
            trips_circuit: false,
            retry_after: error.retry_after(),
            severity: error.severity(),
        }
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &CommonError) -> Classification {
        if self.matches_terminal_pattern(error) {
            return self.base(ErrorClass::Terminal, error);
        }

        match error {
            CommonError::RateLimitExceeded { .. }
            | CommonError::CircuitBreakerOpen { .. }
            | CommonError::Lock { .. } => self.base(ErrorClass::Retryable, error),
            CommonError::Timeout { .. } => {
                Classification { trips_circuit: true, ..self.base(ErrorClass::Transient, error) }
            }
            CommonError::Backend { is_retryable: true, .. } => {
                Classification { trips_circuit: true, ..self.base(ErrorClass::Transient, error) }
            }
            CommonError::Backend { is_retryable: false, .. } => {
                Classification { trips_circuit: true, ..self.base(ErrorClass::Terminal, error) }
            }
            CommonError::Degraded { .. } => Classification {
                backoff: BackoffKind::Linear,
                trips_circuit: true,
                ..self.base(ErrorClass::Degraded, error)
            },
            CommonError::Internal { .. } => self.base(ErrorClass::Unknown, error),
            _ => self.base(ErrorClass::Terminal, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_domain::BackoffPolicy;

    use super::*;

    fn classifier() -> DefaultClassifier {
        DefaultClassifier::new(ClassifierSettings {
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            terminal_patterns: vec!["Invalid API Key".into()],
        })
    }

    #[test]
    fn test_timeouts_are_transient_and_trip() {
        let c = classifier().classify(&CommonError::timeout("fetch", Duration::from_secs(5)));
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(c.retryable);
        assert!(c.trips_circuit);
        assert_eq!(c.max_retries, 2);
    }

    #[test]
    fn test_validation_is_terminal() {
        let classifier = classifier();
        let err = CommonError::validation("email", "missing @");
        let c = classifier.classify(&err);
        assert_eq!(c.class, ErrorClass::Terminal);
        assert!(!c.trips_circuit);
        assert_eq!(classifier.next_action(&err, 1, None), NextAction::DeadLetter);
    }

    #[test]
    fn test_terminal_patterns_override_variant() {
        let err = CommonError::backend("crm", "invalid api key supplied", true);
        let c = classifier().classify(&err);
        assert_eq!(c.class, ErrorClass::Terminal);
        assert!(!c.retryable);
    }

    #[test]
    fn test_exponential_delays_until_exhausted() {
        let classifier = classifier();
        let err = CommonError::backend("crm", "503", true);
        assert_eq!(
            classifier.next_action(&err, 1, None),
            NextAction::Retry { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            classifier.next_action(&err, 2, None),
            NextAction::Retry { delay: Duration::from_millis(200) }
        );
        assert_eq!(classifier.next_action(&err, 3, None), NextAction::DeadLetter);
    }

    #[test]
    fn test_retry_after_hint_is_a_floor() {
        let err = CommonError::rate_limited(Duration::from_secs(3));
        let action = classifier().next_action(&err, 1, None);
        assert_eq!(action, NextAction::Retry { delay: Duration::from_secs(3) });
    }

    #[test]
    fn test_policy_overrides_retry_budget() {
        let policy = RetryPolicy { max_retries: 5, backoff: BackoffPolicy::fixed(50) };
        let err = CommonError::timeout("fetch", Duration::from_secs(1));
        assert_eq!(
            classifier().next_action(&err, 4, Some(&policy)),
            NextAction::Retry { delay: Duration::from_millis(50) }
        );

        // Still terminal under a generous policy
        let err = CommonError::unauthorized("export");
        assert_eq!(classifier().next_action(&err, 1, Some(&policy)), NextAction::DeadLetter);
    }

    #[test]
    fn test_informational_failures_are_discarded() {
        let err = CommonError::not_found_with_id("invoice", "inv-9");
        assert_eq!(classifier().next_action(&err, 1, None), NextAction::Discard);
    }
}
