//! Observability boundary: every state transition, cache eviction and error record
//! leaves the crate through a single [`EventSink::emit`] call.
//!
//! The crate does not define a log format, storage or transport for these events.
//! [`TracingEventSink`] forwards them into `tracing`; [`InMemoryEventSink`] keeps them
//! for tests; [`CompositeEventSink`] fans out to several destinations.

use crate::recovery::ErrorRecord;
use crate::resilience::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An `acquire` that was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedEvent {
    pub key: String,
    pub shard_id: usize,
    pub cost: u32,
    /// `-1` when the cost can never be satisfied by one shard.
    pub retry_after_ms: i64,
    pub timestamp: f64,
}

/// Reservation lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub reservation_id: String,
    pub shard_id: usize,
    pub tokens: u32,
    pub wait_ms: u64,
    pub timestamp: f64,
}

/// Routing ring rebuilt after a utilization imbalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub imbalance_ratio: f64,
    pub utilization: Vec<f64>,
    pub ring_version: u64,
    pub timestamp: f64,
}

/// Circuit breaker transition; emitted once per transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub reason: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    L1,
    L2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    Capacity,
    Memory,
    Quota,
}

/// Entry removed from a cache tier by expiry or size pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvictionEvent {
    pub key: String,
    pub tier: CacheTier,
    pub reason: EvictionReason,
    pub size_bytes: usize,
    pub timestamp: f64,
}

/// Typed resilience events (extensible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResilienceEvent {
    RateLimited(RateLimitedEvent),
    ReservationCreated(ReservationEvent),
    ReservationExpired(ReservationEvent),
    ShardsRebalanced(RebalanceEvent),
    CircuitStateChanged(StateChangeEvent),
    CacheEvicted(CacheEvictionEvent),
    ErrorRecorded(ErrorRecord),
}

impl ResilienceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::RateLimited(_) => "rate_limited",
            ResilienceEvent::ReservationCreated(_) => "reservation_created",
            ResilienceEvent::ReservationExpired(_) => "reservation_expired",
            ResilienceEvent::ShardsRebalanced(_) => "shards_rebalanced",
            ResilienceEvent::CircuitStateChanged(_) => "circuit_state_changed",
            ResilienceEvent::CacheEvicted(_) => "cache_evicted",
            ResilienceEvent::ErrorRecorded(_) => "error_recorded",
        }
    }
}

/// Event sink trait.
///
/// `emit` is called synchronously, sometimes while a component lock is held (breaker
/// transitions are emitted in transition order), so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ResilienceEvent);
}

/// No-op sink (default).
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _: ResilienceEvent) {}
}

/// Returns a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}

/// Adapts a closure into an [`EventSink`].
pub struct FnEventSink<F>(pub F);

impl<F> EventSink for FnEventSink<F>
where
    F: Fn(ResilienceEvent) + Send + Sync,
{
    fn emit(&self, event: ResilienceEvent) {
        (self.0)(event)
    }
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Mutex<Vec<ResilienceEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.lock().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<ResilienceEvent> {
        self.lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn state_changes(&self) -> Vec<StateChangeEvent> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ResilienceEvent::CircuitStateChanged(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ResilienceEvent::ErrorRecorded(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResilienceEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: ResilienceEvent) {
        let mut events = self.lock();
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
    }
}

/// Forwards events into `tracing`.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ResilienceEvent) {
        match &event {
            ResilienceEvent::CircuitStateChanged(c) => tracing::warn!(
                service = c.service.as_str(),
                from = ?c.from,
                to = ?c.to,
                consecutive_failures = c.consecutive_failures,
                reason = c.reason.as_str(),
                "circuit breaker state changed"
            ),
            ResilienceEvent::ErrorRecorded(r) => tracing::info!(
                error_id = %r.id,
                category = ?r.category,
                severity = ?r.severity,
                fingerprint = r.fingerprint.as_str(),
                recovered = r.recovered,
                "error recorded"
            ),
            ResilienceEvent::ShardsRebalanced(r) => tracing::info!(
                imbalance_ratio = r.imbalance_ratio,
                ring_version = r.ring_version,
                "rate limiter shards rebalanced"
            ),
            ResilienceEvent::RateLimited(r) => tracing::debug!(
                key = r.key.as_str(),
                shard_id = r.shard_id,
                retry_after_ms = r.retry_after_ms,
                "request throttled"
            ),
            other => tracing::debug!(event = other.name(), "{:?}", other),
        }
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: ResilienceEvent) {
        for s in &self.sinks {
            s.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn eviction(key: &str) -> ResilienceEvent {
        ResilienceEvent::CacheEvicted(CacheEvictionEvent {
            key: key.into(),
            tier: CacheTier::L1,
            reason: EvictionReason::Capacity,
            size_bytes: 3,
            timestamp: timestamp(),
        })
    }

    #[test]
    fn test_in_memory_sink_bounded() {
        let sink = InMemoryEventSink::new(2);
        sink.emit(eviction("a"));
        sink.emit(eviction("b"));
        sink.emit(eviction("c"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ResilienceEvent::CacheEvicted(e) => assert_eq!(e.key, "b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_composite_fans_out() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let memory = Arc::new(InMemoryEventSink::default());
        let sink = CompositeEventSink::new()
            .add_sink(memory.clone())
            .add_sink(Arc::new(FnEventSink(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })));
        sink.emit(eviction("a"));
        assert_eq!(memory.len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(memory.events_named("cache_evicted").len(), 1);
    }
}
