use super::ring::{HashRing, DEFAULT_VNODES};
use super::shard::{Algorithm, Claim, Redeem, ShardSnapshot, Slot, Take, TokenBucketShard};
use crate::events::{
    noop_sink, timestamp, EventSink, RateLimitedEvent, RebalanceEvent, ReservationEvent,
    ResilienceEvent,
};
use crate::persistence::{shard_state_id, StateStore, StoredState};
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Each shard keeps at least this much capacity when the shard count is derived.
const MIN_SHARD_CAPACITY: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Limiter name, used in persisted shard ids.
    pub name: String,
    /// Aggregate burst capacity, split evenly across shards.
    pub capacity: f64,
    /// Aggregate refill rate (tokens per second), split evenly across shards.
    pub refill_per_second: f64,
    /// Explicit shard count; derived from the aggregate rate when unset.
    pub shards: Option<usize>,
    pub algorithm: Algorithm,
    /// How long a reservation stays executable after its `execute_at`.
    pub reservation_ttl_ms: u64,
    pub adaptive: bool,
    pub rebalance_threshold: f64,
    pub rebalance_interval_ms: u64,
    pub virtual_nodes: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: 10.0,
            refill_per_second: 10.0,
            shards: None,
            algorithm: Algorithm::TokenBucket,
            reservation_ttl_ms: 60_000,
            adaptive: false,
            rebalance_threshold: 0.3,
            rebalance_interval_ms: 300_000,
            virtual_nodes: DEFAULT_VNODES,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// One second of burst at the given rate, at least one token.
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: rps.max(1.0),
            refill_per_second: rps,
            ..Self::default()
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_per_second = rate;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Enable rebalancing when `(max - min) / max` utilization exceeds `threshold`,
    /// checked at most once per `interval`.
    pub fn with_adaptive(mut self, threshold: f64, interval: Duration) -> Self {
        self.adaptive = true;
        self.rebalance_threshold = threshold;
        self.rebalance_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: String| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(format!("rate_limiter.{}", field))
                    .with_source("rate_limiter"),
            ))
        };
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return invalid("capacity", format!("capacity must be positive, got {}", self.capacity));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return invalid(
                "refill_per_second",
                format!("refill rate must be positive, got {}", self.refill_per_second),
            );
        }
        if self.shards == Some(0) {
            return invalid("shards", "shard count must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.rebalance_threshold) {
            return invalid(
                "rebalance_threshold",
                format!("threshold must be within [0, 1], got {}", self.rebalance_threshold),
            );
        }
        if self.virtual_nodes == 0 {
            return invalid("virtual_nodes", "virtual node count must be at least 1".to_string());
        }
        Ok(())
    }

    /// Shard count: the explicit override, or a band on the aggregate per-minute rate
    /// (`<100 → 1`, `<1000 → 4`, `≤10000 → 8`, above → 16) reduced so each shard keeps
    /// at least ten tokens of capacity, rounded down to a power of two.
    pub fn shard_count(&self) -> usize {
        if let Some(n) = self.shards {
            return n.max(1);
        }
        let per_minute = self.refill_per_second * 60.0;
        let band = if per_minute < 100.0 {
            1
        } else if per_minute < 1_000.0 {
            4
        } else if per_minute <= 10_000.0 {
            8
        } else {
            16
        };
        let by_capacity = ((self.capacity / MIN_SHARD_CAPACITY).floor() as usize).max(1);
        let n = band.min(by_capacity);
        // largest power of two <= n
        1usize << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Why an admission was or was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    Granted,
    Throttled,
    /// Cost exceeds what one shard can ever hold.
    ExceedsCapacity,
    /// Reservation exists but its `execute_at` has not been reached.
    NotYetDue,
    AlreadyConsumed,
    Expired,
    UnknownReservation,
}

/// Result of `acquire` / `execute_reservation`.
///
/// `retry_after_ms` is `0` when allowed, the estimated wait when throttled or not yet due,
/// and `-1` when retrying cannot help (see `reason`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub retry_after_ms: i64,
    pub shard_id: usize,
    pub remaining: f64,
    pub reason: AdmissionReason,
}

impl Admission {
    fn granted(shard_id: usize, remaining: f64) -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            shard_id,
            remaining,
            reason: AdmissionReason::Granted,
        }
    }

    fn denied(shard_id: usize, retry_after_ms: i64, reason: AdmissionReason) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
            shard_id,
            remaining: 0.0,
            reason,
        }
    }
}

/// Reservation handle; embeds the shard so execution never consults a global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId {
    pub shard: usize,
    pub seq: u64,
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}-{}", self.shard, self.seq)
    }
}

impl FromStr for ReservationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Option<Self> {
            let (shard, seq) = s.strip_prefix('r')?.split_once('-')?;
            Some(Self {
                shard: shard.parse().ok()?,
                seq: seq.parse().ok()?,
            })
        };
        parse().ok_or_else(|| {
            Error::validation_with_context(
                format!("malformed reservation id '{}'", s),
                ErrorContext::new().with_details("expected r<shard>-<seq>"),
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub shard_id: usize,
    pub key: String,
    pub tokens_requested: u32,
    pub created_at: Instant,
    pub execute_at: Instant,
    pub expires_at: Instant,
}

impl Reservation {
    /// Time left until the reservation becomes executable.
    pub fn wait_time(&self) -> Duration {
        self.execute_at.saturating_duration_since(Instant::now())
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.execute_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub shard_count: usize,
    pub requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub reservations_created: u64,
    pub reservations_executed: u64,
    pub reservations_expired: u64,
    pub reservations_cancelled: u64,
    pub shard_tokens: Vec<f64>,
    pub shard_utilization: Vec<f64>,
    /// `(max - min) / max` over shard utilization; `0.0` when idle.
    pub imbalance_ratio: f64,
    pub ring_version: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    reservations_created: AtomicU64,
    reservations_executed: AtomicU64,
    reservations_expired: AtomicU64,
    reservations_cancelled: AtomicU64,
}

fn ceil_millis(d: Duration) -> u64 {
    let nanos = d.as_nanos();
    ((nanos + 999_999) / 1_000_000) as u64
}

fn imbalance(utilization: &[f64]) -> f64 {
    let max = utilization.iter().cloned().fold(0.0, f64::max);
    if max <= 0.0 {
        return 0.0;
    }
    let min = utilization.iter().cloned().fold(f64::INFINITY, f64::min);
    (max - min) / max
}

/// Admission control over a set of independently locked shards.
///
/// `acquire` never blocks. `reserve` + `execute_reservation` is a two-phase pattern where the
/// caller decides when to wait (typically `tokio::time::sleep_until(reservation.execute_at)`).
pub struct ShardedRateLimiter {
    config: RateLimiterConfig,
    shards: Vec<TokenBucketShard>,
    ring: ArcSwap<HashRing>,
    last_rebalance: Mutex<Instant>,
    counters: Counters,
    sink: Arc<dyn EventSink>,
}

impl ShardedRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        let n = config.shard_count();
        let per_capacity = config.capacity / n as f64;
        let per_rate = config.refill_per_second / n as f64;
        let shards = (0..n)
            .map(|id| TokenBucketShard::new(id, per_capacity, per_rate, config.algorithm))
            .collect();
        tracing::debug!(
            limiter = config.name.as_str(),
            shards = n,
            shard_capacity = per_capacity,
            shard_refill = per_rate,
            "rate limiter created"
        );
        Ok(Self {
            ring: ArcSwap::from_pointee(HashRing::uniform(n, config.virtual_nodes)),
            shards,
            last_rebalance: Mutex::new(Instant::now()),
            counters: Counters::default(),
            sink: noop_sink(),
            config,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, id: usize) -> Option<&TokenBucketShard> {
        self.shards.get(id)
    }

    /// Shard currently responsible for `key`.
    pub fn route(&self, key: &str) -> usize {
        self.ring.load().route(key)
    }

    /// Try to take `cost` tokens from the key's shard right now.
    pub fn acquire(&self, key: &str, cost: u32) -> Admission {
        self.maybe_rebalance();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let shard_id = self.route(key);
        let shard = &self.shards[shard_id];
        let admission = match shard.try_take(cost) {
            Take::Taken { remaining } => Admission::granted(shard_id, remaining),
            Take::Wait(wait) => Admission::denied(
                shard_id,
                ceil_millis(wait) as i64,
                AdmissionReason::Throttled,
            ),
            Take::Never => Admission::denied(shard_id, -1, AdmissionReason::ExceedsCapacity),
        };
        if admission.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            self.sink.emit(ResilienceEvent::RateLimited(RateLimitedEvent {
                key: key.to_string(),
                shard_id,
                cost,
                retry_after_ms: admission.retry_after_ms,
                timestamp: timestamp(),
            }));
        }
        admission
    }

    /// [`acquire`](Self::acquire) with refusals as errors: `NoCapacity` when the cost can never
    /// fit one shard, `Throttled` otherwise.
    pub fn try_acquire(&self, key: &str, cost: u32) -> Result<Admission> {
        let admission = self.acquire(key, cost);
        match admission.reason {
            AdmissionReason::Granted => Ok(admission),
            AdmissionReason::ExceedsCapacity => Err(Error::NoCapacity {
                cost,
                capacity: self.shards[admission.shard_id].capacity(),
            }),
            _ => Err(Error::Throttled {
                retry_after_ms: admission.retry_after_ms.max(1) as u64,
            }),
        }
    }

    /// Claim `cost` tokens at the earliest instant the key's shard can serve them after every
    /// earlier reservation on that shard. Fails without side effects when that instant is more
    /// than `max_wait` away.
    pub fn reserve(&self, key: &str, cost: u32, max_wait: Duration) -> Result<Reservation> {
        if self.config.algorithm != Algorithm::TokenBucket {
            return Err(Error::configuration_with_context(
                "reservations require the token bucket algorithm",
                ErrorContext::new()
                    .with_field_path("rate_limiter.algorithm")
                    .with_details(format!("{:?}", self.config.algorithm)),
            ));
        }
        self.maybe_rebalance();
        let shard_id = self.route(key);
        let shard = &self.shards[shard_id];
        let ttl = Duration::from_millis(self.config.reservation_ttl_ms);
        let created_at = Instant::now();
        let (claim, expired) = shard.claim(cost, max_wait, ttl);
        self.report_expired(shard_id, expired);
        match claim {
            Claim::Never => Err(Error::NoCapacity {
                cost,
                capacity: shard.capacity(),
            }),
            Claim::TooLate { wait } => Err(Error::Throttled {
                retry_after_ms: ceil_millis(wait.saturating_sub(max_wait)).max(1),
            }),
            Claim::Claimed { seq, execute_at } => {
                let id = ReservationId {
                    shard: shard_id,
                    seq,
                };
                self.counters
                    .reservations_created
                    .fetch_add(1, Ordering::Relaxed);
                let wait = execute_at.saturating_duration_since(created_at);
                self.sink
                    .emit(ResilienceEvent::ReservationCreated(ReservationEvent {
                        reservation_id: id.to_string(),
                        shard_id,
                        tokens: cost,
                        wait_ms: ceil_millis(wait),
                        timestamp: timestamp(),
                    }));
                Ok(Reservation {
                    id,
                    shard_id,
                    key: key.to_string(),
                    tokens_requested: cost,
                    created_at,
                    execute_at,
                    expires_at: execute_at + ttl,
                })
            }
        }
    }

    /// Redeem a reservation. Allowed exactly once, at or after `execute_at`.
    pub fn execute_reservation(&self, id: &ReservationId) -> Admission {
        let Some(shard) = self.shards.get(id.shard) else {
            return Admission::denied(id.shard, -1, AdmissionReason::UnknownReservation);
        };
        match shard.redeem(id.seq) {
            Redeem::Granted => {
                self.counters
                    .reservations_executed
                    .fetch_add(1, Ordering::Relaxed);
                Admission::granted(id.shard, shard.available())
            }
            Redeem::Pending(wait) => {
                Admission::denied(id.shard, ceil_millis(wait) as i64, AdmissionReason::NotYetDue)
            }
            Redeem::Consumed => Admission::denied(id.shard, -1, AdmissionReason::AlreadyConsumed),
            Redeem::Expired => {
                self.counters
                    .reservations_expired
                    .fetch_add(1, Ordering::Relaxed);
                self.sink
                    .emit(ResilienceEvent::ReservationExpired(ReservationEvent {
                        reservation_id: id.to_string(),
                        shard_id: id.shard,
                        tokens: 0,
                        wait_ms: 0,
                        timestamp: timestamp(),
                    }));
                Admission::denied(id.shard, -1, AdmissionReason::Expired)
            }
            Redeem::Unknown => {
                Admission::denied(id.shard, -1, AdmissionReason::UnknownReservation)
            }
        }
    }

    /// Give back an unexecuted reservation. Returns `false` if it was already consumed,
    /// expired or unknown.
    pub fn cancel_reservation(&self, id: &ReservationId) -> bool {
        let cancelled = self
            .shards
            .get(id.shard)
            .map(|s| s.cancel(id.seq))
            .unwrap_or(false);
        if cancelled {
            self.counters
                .reservations_cancelled
                .fetch_add(1, Ordering::Relaxed);
        }
        cancelled
    }

    /// Drop every reservation past its expiry and release its tokens.
    pub fn purge_expired_reservations(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| self.report_expired(shard.id(), shard.purge_expired()))
            .sum()
    }

    fn report_expired(&self, shard_id: usize, expired: Vec<(u64, Slot)>) -> usize {
        if expired.is_empty() {
            return 0;
        }
        let count = expired.len();
        for (seq, slot) in expired {
            self.sink
                .emit(ResilienceEvent::ReservationExpired(ReservationEvent {
                    reservation_id: ReservationId {
                        shard: shard_id,
                        seq,
                    }
                    .to_string(),
                    shard_id,
                    tokens: slot.tokens,
                    wait_ms: 0,
                    timestamp: timestamp(),
                }));
        }
        self.counters
            .reservations_expired
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn maybe_rebalance(&self) {
        if !self.config.adaptive || self.shards.len() < 2 {
            return;
        }
        let interval = Duration::from_millis(self.config.rebalance_interval_ms);
        let due = match self.last_rebalance.try_lock() {
            Ok(mut last) if last.elapsed() >= interval => {
                *last = Instant::now();
                true
            }
            _ => false,
        };
        if due {
            self.rebalance_now();
        }
    }

    /// Measure utilization since the last check and rebuild the routing ring if it is
    /// imbalanced beyond the configured threshold. Existing reservations stay on their shard.
    pub fn rebalance(&self) -> Option<RebalanceEvent> {
        if let Ok(mut last) = self.last_rebalance.lock() {
            *last = Instant::now();
        }
        self.rebalance_now()
    }

    fn rebalance_now(&self) -> Option<RebalanceEvent> {
        let utilization: Vec<f64> = self.shards.iter().map(|s| s.utilization()).collect();
        for shard in &self.shards {
            shard.reset_utilization();
        }
        let ratio = imbalance(&utilization);
        if self.shards.len() < 2 || ratio <= self.config.rebalance_threshold {
            return None;
        }
        let version = self.ring.load().version() + 1;
        self.ring.store(Arc::new(HashRing::rebalanced(
            &utilization,
            self.config.virtual_nodes,
            version,
        )));
        let event = RebalanceEvent {
            imbalance_ratio: ratio,
            utilization,
            ring_version: version,
            timestamp: timestamp(),
        };
        tracing::info!(
            limiter = self.config.name.as_str(),
            imbalance_ratio = ratio,
            ring_version = version,
            "rebuilt shard routing ring"
        );
        self.sink
            .emit(ResilienceEvent::ShardsRebalanced(event.clone()));
        Some(event)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let shard_utilization: Vec<f64> = self.shards.iter().map(|s| s.utilization()).collect();
        RateLimiterStats {
            name: self.config.name.clone(),
            shard_count: self.shards.len(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            reservations_created: self.counters.reservations_created.load(Ordering::Relaxed),
            reservations_executed: self.counters.reservations_executed.load(Ordering::Relaxed),
            reservations_expired: self.counters.reservations_expired.load(Ordering::Relaxed),
            reservations_cancelled: self.counters.reservations_cancelled.load(Ordering::Relaxed),
            shard_tokens: self.shards.iter().map(|s| s.available()).collect(),
            imbalance_ratio: imbalance(&shard_utilization),
            shard_utilization,
            ring_version: self.ring.load().version(),
        }
    }

    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        self.shards.iter().map(|s| s.snapshot()).collect()
    }

    /// Save every shard's token level.
    pub fn persist(&self, store: &dyn StateStore) -> Result<()> {
        for snapshot in self.snapshots() {
            store.save(
                &shard_state_id(&self.config.name, snapshot.shard_id),
                &StoredState::Shard(snapshot),
            )?;
        }
        Ok(())
    }

    /// Load saved token levels. Snapshots taken with a different shard geometry are skipped.
    /// Returns the number of shards restored.
    pub fn restore(&self, store: &dyn StateStore) -> Result<usize> {
        let mut restored = 0;
        for shard in &self.shards {
            let id = shard_state_id(&self.config.name, shard.id());
            match store.load(&id)? {
                Some(StoredState::Shard(snap))
                    if (snap.capacity - shard.capacity()).abs() < 1e-9
                        && (snap.refill_per_second - shard.refill_per_second()).abs() < 1e-9 =>
                {
                    shard.restore(&snap);
                    restored += 1;
                }
                Some(_) => {
                    tracing::warn!(state_id = id.as_str(), "ignoring incompatible shard snapshot");
                }
                None => {}
            }
        }
        Ok(restored)
    }

    /// Refill every shard and drop all reservations.
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.reset();
        }
    }
}

impl fmt::Debug for ShardedRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedRateLimiter")
            .field("name", &self.config.name)
            .field("shards", &self.shards.len())
            .field("ring_version", &self.ring.load().version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventSink;
    use crate::persistence::MemoryStateStore;
    use tokio::time::advance;

    #[test]
    fn test_rate_limiter_config_from_rps() {
        let config = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(config.refill_per_second, 0.5);
        assert_eq!(config.capacity, 1.0);
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
    }

    #[test]
    fn test_shard_count_bands() {
        let cfg = |cap: f64, rps: f64| RateLimiterConfig::new().with_capacity(cap).with_refill_rate(rps);
        assert_eq!(cfg(1_000.0, 1.0).shard_count(), 1); // 60/min
        assert_eq!(cfg(1_000.0, 10.0).shard_count(), 4); // 600/min
        assert_eq!(cfg(1_000.0, 100.0).shard_count(), 8); // 6000/min
        assert_eq!(cfg(1_000.0, 1_000.0).shard_count(), 16);
        // bounded by per-shard capacity, rounded to a power of two
        assert_eq!(cfg(60.0, 1_000.0).shard_count(), 4);
        assert_eq!(cfg(10.0, 10.0).shard_count(), 1);
        assert_eq!(cfg(10.0, 10.0).with_shards(3).shard_count(), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ShardedRateLimiter::new(RateLimiterConfig::new().with_capacity(0.0)).is_err());
        assert!(ShardedRateLimiter::new(RateLimiterConfig::new().with_refill_rate(-2.0)).is_err());
        let err = ShardedRateLimiter::new(RateLimiterConfig::new().with_shards(0)).unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("rate_limiter.shards")
        );
    }

    #[test]
    fn test_reservation_id_parse() {
        let id: ReservationId = "r3-42".parse().unwrap();
        assert_eq!(id, ReservationId { shard: 3, seq: 42 });
        assert_eq!(id.to_string(), "r3-42");
        assert!("3-42".parse::<ReservationId>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_acquire_emits_event() {
        let sink = Arc::new(InMemoryEventSink::default());
        let limiter = ShardedRateLimiter::new(RateLimiterConfig::new().with_capacity(1.0))
            .unwrap()
            .with_sink(sink.clone());
        assert!(limiter.acquire("k", 1).allowed);
        let denied = limiter.acquire("k", 1);
        assert_eq!(denied.reason, AdmissionReason::Throttled);
        assert_eq!(sink.events_named("rate_limited").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cost() {
        let limiter = ShardedRateLimiter::new(RateLimiterConfig::new()).unwrap();
        let admission = limiter.acquire("k", 11);
        assert!(!admission.allowed);
        assert_eq!(admission.retry_after_ms, -1);
        assert!(matches!(
            limiter.reserve("k", 11, Duration::from_secs(60)),
            Err(Error::NoCapacity { cost: 11, .. })
        ));
        assert!(matches!(
            limiter.try_acquire("k", 11),
            Err(Error::NoCapacity { cost: 11, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_reports_throttling() {
        let limiter = ShardedRateLimiter::new(
            RateLimiterConfig::new().with_capacity(1.0).with_refill_rate(10.0),
        )
        .unwrap();
        assert!(limiter.try_acquire("k", 1).is_ok());
        match limiter.try_acquire("k", 1) {
            Err(Error::Throttled { retry_after_ms }) => assert_eq!(retry_after_ms, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_algorithm_rejects_reserve() {
        let limiter = ShardedRateLimiter::new(
            RateLimiterConfig::new().with_algorithm(Algorithm::FixedWindow),
        )
        .unwrap();
        assert!(limiter.acquire("k", 1).allowed);
        assert!(matches!(
            limiter.reserve("k", 1, Duration::from_secs(1)),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_reservation_is_released() {
        let limiter = ShardedRateLimiter::new(
            RateLimiterConfig::new()
                .with_capacity(2.0)
                .with_refill_rate(1.0)
                .with_reservation_ttl(Duration::from_millis(100)),
        )
        .unwrap();
        let r = limiter.reserve("k", 2, Duration::ZERO).unwrap();
        advance(Duration::from_millis(150)).await;
        let admission = limiter.execute_reservation(&r.id);
        assert_eq!(admission.reason, AdmissionReason::Expired);
        assert_eq!(limiter.stats().reservations_expired, 1);
        // tokens came back (capped at capacity)
        assert!(limiter.acquire("k", 2).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_and_restore() {
        let store = MemoryStateStore::new();
        let config = RateLimiterConfig::new().with_name("api").with_refill_rate(0.001);
        let limiter = ShardedRateLimiter::new(config.clone()).unwrap();
        for _ in 0..7 {
            assert!(limiter.acquire("k", 1).allowed);
        }
        limiter.persist(&store).unwrap();

        let fresh = ShardedRateLimiter::new(config).unwrap();
        assert_eq!(fresh.restore(&store).unwrap(), 1);
        let tokens = fresh.stats().shard_tokens[0];
        assert!(tokens < 4.0, "restored tokens {}", tokens);

        let other = ShardedRateLimiter::new(
            RateLimiterConfig::new().with_name("api").with_capacity(20.0).with_refill_rate(0.001),
        )
        .unwrap();
        assert_eq!(other.restore(&store).unwrap(), 0);
    }
}
