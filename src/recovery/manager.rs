//! Classify → select strategy → execute.

use super::classify::{classify, strategy_for, ErrorCategory, RecoveryStrategy};
use super::policy::RetryPolicy;
use super::record::ErrorRecord;
use crate::cache::MultiTierCache;
use crate::events::{noop_sink, EventSink, ResilienceEvent};
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

type FallbackFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// Per-call recovery inputs: which breaker to use and what to fall back to.
pub struct RecoveryContext<T> {
    service: String,
    cache_key: Option<String>,
    fallback_fn: Option<FallbackFn<T>>,
    fallback_value: Option<T>,
    extra: BTreeMap<String, String>,
}

impl<T> Default for RecoveryContext<T> {
    fn default() -> Self {
        Self {
            service: "default".to_string(),
            cache_key: None,
            fallback_fn: None,
            fallback_value: None,
            extra: BTreeMap::new(),
        }
    }
}

impl<T> RecoveryContext<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker used by the circuit-break strategy.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Key whose cached value (even if expired) may be served as a fallback.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_fallback_value(mut self, value: T) -> Self {
        self.fallback_value = Some(value);
        self
    }

    pub fn with_fallback_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fallback_fn = Some(Box::new(move || f().boxed()));
        self
    }

    /// Extra key/value pairs copied into the emitted [`ErrorRecord`].
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn has_fallback(&self) -> bool {
        self.cache_key.is_some() || self.fallback_fn.is_some() || self.fallback_value.is_some()
    }

    fn record_context(&self) -> BTreeMap<String, String> {
        let mut ctx = self.extra.clone();
        ctx.insert("service".to_string(), self.service.clone());
        if let Some(key) = &self.cache_key {
            ctx.insert("cache_key".to_string(), key.clone());
        }
        ctx
    }
}

impl<T> fmt::Debug for RecoveryContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("service", &self.service)
            .field("cache_key", &self.cache_key)
            .field("fallback_fn", &self.fallback_fn.is_some())
            .field("fallback_value", &self.fallback_value.is_some())
            .field("extra", &self.extra)
            .finish()
    }
}

struct Outcome<T> {
    result: Result<T>,
    attempts: u32,
}

/// The only component that retries or falls back.
///
/// Retry sleeps use `tokio::time`, so paused-clock tests run instantly.
pub struct ErrorRecoveryManager {
    policy: RetryPolicy,
    overrides: HashMap<ErrorCategory, RecoveryStrategy>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    cache: Option<MultiTierCache>,
    sink: Arc<dyn EventSink>,
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ErrorRecoveryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            overrides: HashMap::new(),
            breakers: None,
            cache: None,
            sink: noop_sink(),
        }
    }

    pub fn with_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    pub fn with_cache(mut self, cache: MultiTierCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the default strategy for `category`.
    pub fn with_strategy(mut self, category: ErrorCategory, strategy: RecoveryStrategy) -> Self {
        self.overrides.insert(category, strategy);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn strategy(&self, error: &Error) -> RecoveryStrategy {
        let category = classify(error);
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| strategy_for(category))
    }

    /// Run `operation` once and recover from its failure.
    pub async fn execute<T, F, Fut>(&self, mut operation: F, context: RecoveryContext<T>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => self.recover(error, operation, context).await,
        }
    }

    /// Recover from `error`, which `operation` has just produced.
    ///
    /// Emits exactly one [`ResilienceEvent::ErrorRecorded`] whatever the outcome.
    pub async fn recover<T, F, Fut>(
        &self,
        error: Error,
        operation: F,
        context: RecoveryContext<T>,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = self.strategy(&error);
        let mut record = ErrorRecord::from_error(&error, strategy, context.record_context());
        debug!(
            kind = error.kind(),
            category = %record.category,
            strategy = strategy.as_str(),
            service = context.service(),
            "recovering from error"
        );

        let outcome = match strategy {
            RecoveryStrategy::Fail => Outcome {
                result: Err(error),
                attempts: 0,
            },
            RecoveryStrategy::Retry => self.retry(error, operation).await,
            RecoveryStrategy::CircuitBreak => self.circuit_break(error, operation, context).await,
            RecoveryStrategy::Fallback => Outcome {
                result: self.fallback(error, context).await,
                attempts: 0,
            },
        };

        record.recovered = outcome.result.is_ok();
        record.attempts = outcome.attempts;
        match &outcome.result {
            Ok(_) => info!(
                fingerprint = record.fingerprint.as_str(),
                strategy = strategy.as_str(),
                attempts = record.attempts,
                "error recovered"
            ),
            Err(e) => warn!(
                fingerprint = record.fingerprint.as_str(),
                strategy = strategy.as_str(),
                attempts = record.attempts,
                error = %e,
                "error not recovered"
            ),
        }
        self.sink.emit(ResilienceEvent::ErrorRecorded(record));
        outcome.result
    }

    async fn retry<T, F, Fut>(&self, error: Error, mut operation: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = error;
        let mut attempt = 0;
        while self.policy.should_retry(&last, attempt) {
            let delay = self.policy.delay(attempt, last.retry_after_ms());
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
            tokio::time::sleep(delay).await;
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    return Outcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => last = e,
            }
        }
        Outcome {
            result: Err(last),
            attempts: attempt,
        }
    }

    async fn circuit_break<T, F, Fut>(
        &self,
        error: Error,
        mut operation: F,
        context: RecoveryContext<T>,
    ) -> Outcome<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(registry) = &self.breakers else {
            return Outcome {
                result: self.fallback(error, context).await,
                attempts: 0,
            };
        };
        match registry.call(context.service(), || operation()).await {
            Ok(value) => Outcome {
                result: Ok(value),
                attempts: 1,
            },
            // rejected without running the operation
            Err(open @ Error::CircuitOpen { .. }) => Outcome {
                result: self.fallback(open, context).await,
                attempts: 0,
            },
            Err(e) => Outcome {
                result: Err(e),
                attempts: 1,
            },
        }
    }

    /// Stale cache read, then fallback function, then fallback value.
    async fn fallback<T>(&self, error: Error, context: RecoveryContext<T>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let (Some(cache), Some(key)) = (&self.cache, &context.cache_key) {
            match cache.get_stale::<T>(key).await {
                Ok(Some(value)) => {
                    debug!(cache_key = key.as_str(), "serving stale cache entry as fallback");
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => warn!(cache_key = key.as_str(), error = %e, "cache fallback failed"),
            }
        }
        if let Some(f) = context.fallback_fn {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => warn!(error = %e, "fallback function failed"),
            }
        }
        match context.fallback_value {
            Some(value) => Ok(value),
            None => Err(error),
        }
    }
}

impl fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("policy", &self.policy)
            .field("overrides", &self.overrides)
            .field("breakers", &self.breakers.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
