use crate::events::{noop_sink, timestamp, EventSink, ResilienceEvent, StateChangeEvent};
use crate::persistence::{circuit_state_id, StateStore, StoredState};
use crate::recovery::{classify, ErrorCategory};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Errors needed inside the burst window before the failure rate is judged.
const BURST_MIN_ERRORS: usize = 3;

/// Opt-in threshold adaptation: error bursts lower `failure_threshold` so the circuit opens
/// sooner, sustained success raises it again. The threshold stays within
/// `min_threshold..=max_threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThreshold {
    pub min_threshold: u32,
    pub max_threshold: u32,
    /// Amount the threshold drops per detected burst.
    pub step: u32,
    pub burst_window_ms: u64,
    /// Failures per second inside the window that count as a burst.
    pub burst_rate_per_sec: f64,
    /// Every this many successes the threshold rises by one.
    pub successes_per_raise: u32,
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self {
            min_threshold: 3,
            max_threshold: 20,
            step: 2,
            burst_window_ms: 300_000,
            burst_rate_per_sec: 0.5,
            successes_per_raise: 10,
        }
    }
}

fn default_trip_on() -> Vec<ErrorCategory> {
    vec![ErrorCategory::Transient, ErrorCategory::System]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Error categories counted as failures. Other errors pass through without touching the
    /// breaker's state.
    pub trip_on: Vec<ErrorCategory>,
    pub adaptive: Option<AdaptiveThreshold>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
            trip_on: default_trip_on(),
            adaptive: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_trip_on(mut self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        self.trip_on = categories.into_iter().collect();
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveThreshold) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Whether `error` counts against the breaker.
    pub fn trips_on(&self, error: &Error) -> bool {
        self.trip_on.contains(&classify(error))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, message: String| {
            Err(Error::configuration_with_context(
                message,
                ErrorContext::new()
                    .with_field_path(format!("circuit_breaker.{}", field))
                    .with_source("circuit_breaker"),
            ))
        };
        let zero = |field: &str| invalid(field, format!("{} must be at least 1", field));
        if self.failure_threshold == 0 {
            return zero("failure_threshold");
        }
        if self.success_threshold == 0 {
            return zero("success_threshold");
        }
        if self.half_open_max_calls == 0 {
            return zero("half_open_max_calls");
        }
        if self.trip_on.is_empty() {
            return invalid("trip_on", "trip_on must name at least one category".into());
        }
        if let Some(adaptive) = &self.adaptive {
            if adaptive.min_threshold == 0 {
                return zero("adaptive.min_threshold");
            }
            if adaptive.step == 0 {
                return zero("adaptive.step");
            }
            if adaptive.successes_per_raise == 0 {
                return zero("adaptive.successes_per_raise");
            }
            if adaptive.burst_window_ms == 0 || adaptive.burst_rate_per_sec <= 0.0 {
                return invalid(
                    "adaptive.burst_rate_per_sec",
                    "burst window and rate must be positive".into(),
                );
            }
            if !(adaptive.min_threshold..=adaptive.max_threshold).contains(&self.failure_threshold)
            {
                return invalid(
                    "failure_threshold",
                    format!(
                        "failure_threshold {} outside adaptive bounds {}..={}",
                        self.failure_threshold, adaptive.min_threshold, adaptive.max_threshold
                    ),
                );
            }
        }
        Ok(())
    }
}

/// Persisted breaker state. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub opened_at_ms: Option<u64>,
    pub last_transition_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Effective threshold; differs from the config only when adaptive.
    pub failure_threshold: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    /// Errors outside `trip_on`.
    pub ignored: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    /// Recent counted failures, for burst detection.
    failure_times: VecDeque<Instant>,
    open_until: Option<Instant>,
    opened_at_ms: Option<u64>,
    last_transition_at_ms: u64,
    trials_in_flight: u32,
    total_calls: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
    ignored: u64,
    failures_by_kind: BTreeMap<String, u64>,
    /// Bumped on every change worth persisting.
    version: u64,
}

/// Per-service breaker.
///
/// Every transition happens under the breaker's own lock and is emitted to the event sink
/// before the lock is released. Persistence runs after the lock is dropped; a save that
/// finds a newer version already written is skipped.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    saved_version: Mutex<u64>,
    store: Option<Arc<dyn StateStore>>,
    sink: Arc<dyn EventSink>,
}

/// One admitted call, held until its outcome is recorded. Dropping it unrecorded releases
/// a half-open trial slot without counting anything.
pub struct CallPermit<B: Deref<Target = CircuitBreaker> = Arc<CircuitBreaker>> {
    breaker: B,
    trial: bool,
    armed: bool,
}

impl<B: Deref<Target = CircuitBreaker>> CallPermit<B> {
    fn admit(breaker: B) -> Result<Self> {
        let trial = breaker.admit()?;
        Ok(Self {
            breaker,
            trial,
            armed: true,
        })
    }

    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Count `result` against the breaker and hand it back unchanged.
    pub fn record<T>(mut self, result: Result<T>) -> Result<T> {
        self.armed = false;
        let breaker = &*self.breaker;
        match &result {
            Ok(_) => breaker.record_success(self.trial),
            Err(e) if breaker.config.trips_on(e) => breaker.record_failure(self.trial, e),
            Err(e) => breaker.record_ignored(self.trial, e),
        }
        result
    }
}

impl<B: Deref<Target = CircuitBreaker>> Drop for CallPermit<B> {
    fn drop(&mut self) {
        if self.armed && self.trial {
            let mut inner = self.breaker.lock();
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(service.into(), config))
    }

    fn from_validated(service: String, config: CircuitBreakerConfig) -> Self {
        let failure_threshold = config.failure_threshold;
        Self {
            service,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                failure_threshold,
                failure_times: VecDeque::new(),
                open_until: None,
                opened_at_ms: None,
                last_transition_at_ms: crate::unix_millis(),
                trials_in_flight: 0,
                total_calls: 0,
                successes: 0,
                failures: 0,
                rejections: 0,
                ignored: 0,
                failures_by_kind: BTreeMap::new(),
                version: 0,
            }),
            saved_version: Mutex::new(0),
            store: None,
            sink: noop_sink(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attach a state store and resume from the state saved there, if any.
    /// A store that cannot be read leaves the breaker closed.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        let id = circuit_state_id(&self.service);
        match store.load(&id) {
            Ok(Some(StoredState::CircuitBreaker(saved))) => self.resume(&saved),
            Ok(Some(_)) => {
                tracing::warn!(state_id = id.as_str(), "stored state is not a circuit breaker")
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                service = self.service.as_str(),
                error = %e,
                "failed to load circuit breaker state"
            ),
        }
        self.store = Some(store);
        self
    }

    fn resume(&mut self, saved: &CircuitBreakerState) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        inner.state = saved.state;
        inner.consecutive_failures = saved.consecutive_failures;
        inner.consecutive_successes = saved.consecutive_successes;
        inner.opened_at_ms = saved.opened_at_ms;
        inner.last_transition_at_ms = saved.last_transition_at_ms;
        if let Some(adaptive) = &self.config.adaptive {
            inner.failure_threshold = saved
                .failure_threshold
                .clamp(adaptive.min_threshold, adaptive.max_threshold);
        }
        if saved.state == CircuitState::Open {
            let opened = saved.opened_at_ms.unwrap_or(saved.last_transition_at_ms);
            let reopen_at = opened.saturating_add(self.config.recovery_timeout_ms);
            let remaining = reopen_at.saturating_sub(crate::unix_millis());
            inner.open_until = Some(Instant::now() + Duration::from_millis(remaining));
        }
        tracing::info!(
            service = self.service.as_str(),
            state = ?saved.state,
            "resumed circuit breaker state"
        );
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `f` under the lock, then persist if it bumped the version.
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (out, dirty) = {
            let mut inner = self.lock();
            let before = inner.version;
            let out = f(&mut inner);
            (out, (inner.version != before).then_some(inner.version))
        };
        if let Some(version) = dirty {
            self.persist(version);
        }
        out
    }

    fn persist(&self, version: u64) {
        let Some(store) = &self.store else {
            return;
        };
        let mut saved = self.saved_version.lock().unwrap_or_else(|p| p.into_inner());
        if *saved >= version {
            return;
        }
        let (latest, state) = {
            let inner = self.lock();
            (inner.version, self.state_locked(&inner))
        };
        match store.save(&circuit_state_id(&self.service), &StoredState::CircuitBreaker(state)) {
            Ok(()) => *saved = latest,
            Err(e) => tracing::warn!(
                service = self.service.as_str(),
                error = %e,
                "failed to persist circuit breaker state"
            ),
        }
    }

    /// Run `f` through the breaker. Errors from `f` are returned unchanged; only those in
    /// `trip_on` count as failures.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = CallPermit::admit(self)?;
        let result = f().await;
        permit.record(result)
    }

    /// Admit a call whose outcome is recorded later, possibly from another task. The
    /// permit owns a handle to the breaker, so it can move into a `'static` future.
    pub fn permit(self: &Arc<Self>) -> Result<CallPermit> {
        CallPermit::admit(self.clone())
    }

    /// Decide whether a call may proceed; `Ok(true)` marks a half-open trial.
    fn admit(&self) -> Result<bool> {
        self.update(|inner| self.admit_locked(inner))
    }

    fn admit_locked(&self, inner: &mut Inner) -> Result<bool> {
        inner.total_calls += 1;
        if inner.state == CircuitState::Open {
            let now = Instant::now();
            match inner.open_until {
                Some(until) if now < until => {
                    inner.rejections += 1;
                    return Err(Error::CircuitOpen {
                        service: self.service.clone(),
                        retry_after_ms: (until - now).as_millis() as u64,
                    });
                }
                _ => self.transition_locked(inner, CircuitState::HalfOpen, "recovery timeout elapsed"),
            }
        }
        match inner.state {
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_max_calls {
                    inner.rejections += 1;
                    return Err(Error::CircuitOpen {
                        service: self.service.clone(),
                        retry_after_ms: 0,
                    });
                }
                inner.trials_in_flight += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_success(&self, trial: bool) {
        self.update(|inner| {
            if trial {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            }
            inner.successes += 1;
            if let Some(adaptive) = &self.config.adaptive {
                inner.failure_times.clear();
                if inner.successes % u64::from(adaptive.successes_per_raise) == 0
                    && inner.failure_threshold < adaptive.max_threshold
                {
                    inner.failure_threshold += 1;
                    inner.version += 1;
                    tracing::debug!(
                        service = self.service.as_str(),
                        failure_threshold = inner.failure_threshold,
                        "sustained success, raised failure threshold"
                    );
                }
            }
            match inner.state {
                CircuitState::Closed => {
                    if std::mem::take(&mut inner.consecutive_failures) > 0 {
                        inner.version += 1;
                    }
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    inner.version += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        self.transition_locked(inner, CircuitState::Closed, "trial calls succeeded");
                    }
                }
                // a call admitted before the circuit opened; the open timer stands
                CircuitState::Open => {}
            }
        })
    }

    fn record_failure(&self, trial: bool, error: &Error) {
        self.update(|inner| {
            if trial {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            }
            inner.failures += 1;
            *inner
                .failures_by_kind
                .entry(error.kind().to_string())
                .or_insert(0) += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.version += 1;
            self.adapt_to_burst(inner);
            match inner.state {
                CircuitState::Closed if inner.consecutive_failures >= inner.failure_threshold => {
                    self.transition_locked(inner, CircuitState::Open, "failure threshold reached");
                }
                CircuitState::HalfOpen => {
                    self.transition_locked(inner, CircuitState::Open, "trial call failed");
                }
                _ => {}
            }
        })
    }

    /// An error outside `trip_on`: the upstream answered, so only the trial slot is released.
    fn record_ignored(&self, trial: bool, error: &Error) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        inner.ignored += 1;
        tracing::debug!(
            service = self.service.as_str(),
            kind = error.kind(),
            "error not counted by circuit breaker"
        );
    }

    /// Lower the threshold when counted failures arrive faster than the burst rate.
    fn adapt_to_burst(&self, inner: &mut Inner) {
        let Some(adaptive) = &self.config.adaptive else {
            return;
        };
        let now = Instant::now();
        let window = Duration::from_millis(adaptive.burst_window_ms);
        inner.failure_times.push_back(now);
        while let Some(first) = inner.failure_times.front() {
            if now.saturating_duration_since(*first) >= window {
                inner.failure_times.pop_front();
            } else {
                break;
            }
        }
        let needed = BURST_MIN_ERRORS.min(inner.failure_threshold as usize);
        let Some(first) = inner.failure_times.front() else {
            return;
        };
        let span = now.saturating_duration_since(*first).as_secs_f64();
        if inner.failure_times.len() < needed || span <= 0.0 {
            return;
        }
        let rate = inner.failure_times.len() as f64 / span;
        if rate > adaptive.burst_rate_per_sec {
            let lowered = inner
                .failure_threshold
                .saturating_sub(adaptive.step)
                .max(adaptive.min_threshold);
            if lowered != inner.failure_threshold {
                inner.failure_threshold = lowered;
                tracing::info!(
                    service = self.service.as_str(),
                    error_rate = rate,
                    failure_threshold = lowered,
                    "failure burst, lowered failure threshold"
                );
            }
        }
    }

    fn transition_locked(&self, inner: &mut Inner, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        let failures_at_transition = inner.consecutive_failures;
        inner.state = to;
        inner.last_transition_at_ms = crate::unix_millis();
        match to {
            CircuitState::Open => {
                inner.open_until = Some(Instant::now() + self.config.recovery_timeout());
                inner.opened_at_ms = Some(inner.last_transition_at_ms);
                inner.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                inner.open_until = None;
                inner.opened_at_ms = None;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
        }
        tracing::info!(
            service = self.service.as_str(),
            from = ?from,
            to = ?to,
            reason,
            "circuit breaker transition"
        );
        self.sink
            .emit(ResilienceEvent::CircuitStateChanged(StateChangeEvent {
                service: self.service.clone(),
                from,
                to,
                consecutive_failures: failures_at_transition,
                reason: reason.to_string(),
                timestamp: timestamp(),
            }));
        inner.version += 1;
    }

    fn state_locked(&self, inner: &Inner) -> CircuitBreakerState {
        CircuitBreakerState {
            service_name: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_threshold: inner.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
            opened_at_ms: inner.opened_at_ms,
            last_transition_at_ms: inner.last_transition_at_ms,
        }
    }

    /// Current state. An open circuit whose timeout has elapsed still reports `Open`
    /// until the next call moves it to half-open.
    pub fn status(&self) -> CircuitState {
        self.lock().state
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.update(|inner| {
            self.transition_locked(inner, CircuitState::Closed, "manual reset");
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.trials_in_flight = 0;
            inner.failure_times.clear();
            inner.version += 1;
        })
    }

    /// Persistable view of the breaker.
    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.lock();
        self.state_locked(&inner)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_threshold: inner.failure_threshold,
            open_remaining_ms: match (inner.state, inner.open_until) {
                (CircuitState::Open, Some(until)) if until > now => {
                    Some((until - now).as_millis() as u64)
                }
                _ => None,
            },
            total_calls: inner.total_calls,
            successes: inner.successes,
            failures: inner.failures,
            rejections: inner.rejections,
            ignored: inner.ignored,
            failures_by_kind: inner.failures_by_kind.clone(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.status())
            .finish()
    }
}

/// One breaker per service name, created on first use.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    store: Option<Arc<dyn StateStore>>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Result<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            store: None,
            sink: noop_sink(),
        })
    }

    pub fn with_override(
        mut self,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self> {
        config.validate()?;
        self.overrides.insert(service.into(), config);
        Ok(self)
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Breaker for `service`, creating (and resuming) it on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(service)
        {
            return b.clone();
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                let mut breaker = CircuitBreaker::from_validated(service.to_string(), config)
                    .with_sink(self.sink.clone());
                if let Some(store) = &self.store {
                    breaker = breaker.with_store(store.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub async fn call<T, F, Fut>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(service).call(f).await
    }

    pub fn status(&self, service: &str) -> CircuitState {
        self.breaker(service).status()
    }

    pub fn reset(&self, service: &str) {
        self.breaker(service).reset();
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for b in breakers {
            b.reset();
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventSink;
    use crate::persistence::MemoryStateStore;
    use tokio::time::advance;

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Err::<(), _>(Error::remote(503, "unavailable")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.call(|| async { Ok(7) }).await
    }

    #[test]
    fn test_circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(1)
            .with_recovery_timeout(Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(10));
        assert!(CircuitBreaker::new("svc", config.with_failure_threshold(0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("svc", CircuitBreakerConfig::default()).unwrap();
        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.snapshot().consecutive_failures, 2);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert_eq!(cb.status(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_pass_through_unchanged() {
        let cb = CircuitBreaker::new("svc", CircuitBreakerConfig::default()).unwrap();
        match fail(&cb).await {
            Err(Error::Remote { status, .. }) => assert_eq!(status, 503),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cb.snapshot().failures_by_kind.get("remote"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trials() {
        let cb = Arc::new(
            CircuitBreaker::new(
                "svc",
                CircuitBreakerConfig::new()
                    .with_failure_threshold(1)
                    .with_recovery_timeout(Duration::from_millis(100)),
            )
            .unwrap(),
        );
        assert!(fail(&cb).await.is_err());
        advance(Duration::from_millis(150)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.status(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&cb).await, Err(Error::CircuitOpen { .. })));
        tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_slot() {
        let cb = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        assert!(fail(&cb).await.is_err());
        advance(Duration::from_millis(150)).await;
        let pending = cb.call(|| std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.status(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_persisted_and_resumed() {
        let store = MemoryStateStore::shared();
        let config = CircuitBreakerConfig::new().with_failure_threshold(2);
        let cb = CircuitBreaker::new("llm", config.clone())
            .unwrap()
            .with_store(store.clone());
        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.status(), CircuitState::Open);

        let resumed = CircuitBreaker::new("llm", config).unwrap().with_store(store);
        assert_eq!(resumed.status(), CircuitState::Open);
        assert!(matches!(succeed(&resumed).await, Err(Error::CircuitOpen { .. })));
    }

    /// Reads the breaker from another thread on every save; a save made while the breaker's
    /// lock is held shows up as `None`.
    #[derive(Default)]
    struct ObservingStore {
        breaker: std::sync::OnceLock<std::sync::Weak<CircuitBreaker>>,
        observed: Mutex<Vec<Option<CircuitState>>>,
    }

    impl StateStore for ObservingStore {
        fn load(&self, _id: &str) -> Result<Option<StoredState>> {
            Ok(None)
        }

        fn save(&self, _id: &str, _state: &StoredState) -> Result<()> {
            let Some(breaker) = self.breaker.get().and_then(std::sync::Weak::upgrade) else {
                return Ok(());
            };
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(breaker.status());
            });
            let seen = rx.recv_timeout(Duration::from_secs(5)).ok();
            self.observed.lock().unwrap().push(seen);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_saved_outside_breaker_lock() {
        let store = Arc::new(ObservingStore::default());
        let cb = Arc::new(
            CircuitBreaker::new("svc", CircuitBreakerConfig::new().with_failure_threshold(1))
                .unwrap()
                .with_store(store.clone()),
        );
        store.breaker.set(Arc::downgrade(&cb)).unwrap();

        assert!(fail(&cb).await.is_err());
        // one save per call, taken after the transition
        assert_eq!(*store.observed.lock().unwrap(), vec![Some(CircuitState::Open)]);
        cb.reset();
        assert_eq!(
            store.observed.lock().unwrap().last(),
            Some(&Some(CircuitState::Closed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_error_releases_trial_slot() {
        let cb = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(100)),
        )
        .unwrap();
        assert!(fail(&cb).await.is_err());
        advance(Duration::from_millis(150)).await;

        let r: Result<()> = cb.call(|| async { Err(Error::remote(422, "bad input")) }).await;
        assert!(matches!(r, Err(Error::Remote { status: 422, .. })));
        assert_eq!(cb.status(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().ignored, 1);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[test]
    fn test_config_rejects_empty_trip_on_and_bad_adaptive_bounds() {
        assert!(CircuitBreakerConfig::new().with_trip_on([]).validate().is_err());
        let adaptive = AdaptiveThreshold::default();
        assert!(CircuitBreakerConfig::new()
            .with_adaptive(adaptive.clone())
            .validate()
            .is_ok());
        assert!(CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_adaptive(adaptive.clone())
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::new()
            .with_adaptive(AdaptiveThreshold {
                successes_per_raise: 0,
                ..adaptive
            })
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_emits_single_transition() {
        let sink = Arc::new(InMemoryEventSink::default());
        let cb = CircuitBreaker::new("svc", CircuitBreakerConfig::new().with_failure_threshold(1))
            .unwrap()
            .with_sink(sink.clone());
        assert!(fail(&cb).await.is_err());
        cb.reset();
        cb.reset();
        let changes = sink.state_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].reason, "manual reset");
        assert_eq!(cb.status(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_overrides_and_snapshots() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .unwrap()
            .with_override("fragile", CircuitBreakerConfig::new().with_failure_threshold(1))
            .unwrap();
        let r: Result<()> = registry
            .call("fragile", || async { Err(Error::transport("reset by peer")) })
            .await;
        assert!(r.is_err());
        assert_eq!(registry.status("fragile"), CircuitState::Open);
        assert_eq!(registry.status("sturdy"), CircuitState::Closed);
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.service).collect();
        assert_eq!(names, vec!["fragile", "sturdy"]);
        registry.reset_all();
        assert_eq!(registry.status("fragile"), CircuitState::Closed);
    }
}
