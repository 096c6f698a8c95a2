//! Retry policy: which errors are retried and how long to wait between attempts.

use super::classify::{classify, ErrorCategory};
use crate::error::ErrorContext;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-invocations after the first failure.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub base: f64,
    /// Upper bound of the uniform jitter added to every computed delay.
    pub jitter_ms: u64,
    /// Errors carrying an HTTP status are retried only for these statuses.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            base: 2.0,
            jitter_ms: 250,
            retryable_statuses: vec![429, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().with_max_attempts(0)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = jitter.as_millis() as u64;
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retryable_statuses = statuses.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base.is_finite() && self.base >= 1.0) {
            return Err(Error::configuration_with_context(
                "backoff base must be at least 1.0",
                ErrorContext::new()
                    .with_field_path("retry.base")
                    .with_details(format!("got {}", self.base)),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::configuration_with_context(
                "initial delay exceeds max delay",
                ErrorContext::new()
                    .with_field_path("retry.initial_delay_ms")
                    .with_details(format!(
                        "{} > {}",
                        self.initial_delay_ms, self.max_delay_ms
                    )),
            ));
        }
        Ok(())
    }

    /// Whether `error` should be re-invoked after `attempt` prior retries.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt >= self.max_attempts || classify(error) != ErrorCategory::Transient {
            return false;
        }
        match error.status() {
            Some(status) => self.retryable_statuses.contains(&status),
            None => true,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    ///
    /// A provider hint takes precedence over the exponential schedule; both are capped
    /// at `max_delay_ms`.
    pub fn base_delay(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        let ms = match hint_ms {
            Some(hint) => hint,
            None => {
                let exp = self.initial_delay_ms as f64 * self.base.powi(attempt as i32);
                if exp.is_finite() {
                    exp.min(self.max_delay_ms as f64) as u64
                } else {
                    self.max_delay_ms
                }
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// [`base_delay`](Self::base_delay) plus `uniform(0, jitter_ms)`.
    pub fn delay(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        let base = self.base_delay(attempt, hint_ms);
        if self.jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_jitter(Duration::ZERO);
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(3, None), Duration::from_millis(800));
        assert_eq!(policy.delay(4, None), Duration::from_millis(1_000));
        assert_eq!(policy.delay(200, None), Duration::from_millis(1_000));
    }

    #[test]
    fn test_hint_takes_precedence() {
        let policy = RetryPolicy::new().with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.base_delay(0, Some(1_500)), Duration::from_millis(1_500));
        assert_eq!(policy.base_delay(0, Some(90_000)), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = policy.delay(0, None);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_should_retry_respects_allowlist() {
        let policy = RetryPolicy::new();
        assert!(policy.should_retry(&Error::remote(503, "busy"), 0));
        assert!(!policy.should_retry(&Error::remote(500, "boom"), 0));
        assert!(!policy.should_retry(&Error::remote(400, "bad"), 0));
        assert!(policy.should_retry(&Error::transport("reset"), 2));
        assert!(!policy.should_retry(&Error::transport("reset"), 3));
        assert!(!RetryPolicy::none().should_retry(&Error::transport("reset"), 0));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new().validate().is_ok());
        assert!(RetryPolicy::new().with_base(0.5).validate().is_err());
        let err = RetryPolicy::new()
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("retry.initial_delay_ms")
        );
    }
}
