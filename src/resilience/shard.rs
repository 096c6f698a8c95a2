//! A single independently locked partition of the limiter's capacity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const EPSILON: f64 = 1e-9;

/// Admission algorithm run by every shard of a limiter.
///
/// - `TokenBucket`: lazily refilled bucket; supports reservations.
/// - `FixedWindow`: at most `capacity` tokens per window of `capacity / refill_per_second`
///   seconds, windows aligned to shard creation.
/// - `SlidingWindow`: same window length; usage is `current + previous * (1 - elapsed / window)`
///   (two-bucket weighted approximation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

/// Persistable view of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard_id: usize,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub tokens: f64,
    pub pending_reservations: usize,
    /// Wall-clock save time (unix ms), used to credit refill on restore.
    pub saved_at_ms: u64,
}

/// Outcome of an immediate take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Take {
    Taken { remaining: f64 },
    Wait(Duration),
    Never,
}

/// Outcome of claiming a future slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Claim {
    Claimed { seq: u64, execute_at: Instant },
    TooLate { wait: Duration },
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Redeem {
    Granted,
    Pending(Duration),
    Consumed,
    Expired,
    Unknown,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub tokens: u32,
    pub execute_at: Instant,
    pub expires_at: Instant,
    pub consumed: bool,
}

#[derive(Debug)]
struct ShardState {
    tokens: f64,
    /// Tokens promised to reservations that refill has not yet produced.
    debt: f64,
    last_refill: Instant,
    window_start: Instant,
    current_count: f64,
    previous_count: f64,
    /// Keyed by creation sequence; `execute_at` is non-decreasing in sequence order.
    reservations: BTreeMap<u64, Slot>,
    next_seq: u64,
    consumed_since_mark: f64,
    mark_at: Instant,
}

pub struct TokenBucketShard {
    id: usize,
    capacity: f64,
    refill_per_second: f64,
    algorithm: Algorithm,
    state: Mutex<ShardState>,
}

impl TokenBucketShard {
    /// Callers validate `capacity > 0` and `refill_per_second > 0`.
    pub(crate) fn new(id: usize, capacity: f64, refill_per_second: f64, algorithm: Algorithm) -> Self {
        let now = Instant::now();
        Self {
            id,
            capacity,
            refill_per_second,
            algorithm,
            state: Mutex::new(ShardState {
                tokens: capacity,
                debt: 0.0,
                last_refill: now,
                window_start: now,
                current_count: 0.0,
                previous_count: 0.0,
                reservations: BTreeMap::new(),
                next_seq: 0,
                consumed_since_mark: 0.0,
                mark_at: now,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    fn lock(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn window(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.refill_per_second)
    }

    fn refill_locked(&self, st: &mut ShardState, now: Instant) {
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let mut added = elapsed * self.refill_per_second;
        let paid = added.min(st.debt);
        st.debt -= paid;
        added -= paid;
        st.tokens = (st.tokens + added).min(self.capacity);
        st.last_refill = now;
    }

    fn roll_window_locked(&self, st: &mut ShardState, now: Instant) {
        let window = self.window();
        let since = now.saturating_duration_since(st.window_start);
        if since < window {
            return;
        }
        let elapsed_windows = (since.as_secs_f64() / window.as_secs_f64()).floor() as u32;
        st.previous_count = if elapsed_windows == 1 { st.current_count } else { 0.0 };
        st.current_count = 0.0;
        st.window_start += window.mul_f64(elapsed_windows as f64);
    }

    /// Current token level after lazy refill (window algorithms report remaining allowance).
    pub fn available(&self) -> f64 {
        let now = Instant::now();
        let mut st = self.lock();
        match self.algorithm {
            Algorithm::TokenBucket => {
                self.refill_locked(&mut st, now);
                st.tokens
            }
            Algorithm::FixedWindow => {
                self.roll_window_locked(&mut st, now);
                (self.capacity - st.current_count).max(0.0)
            }
            Algorithm::SlidingWindow => {
                self.roll_window_locked(&mut st, now);
                (self.capacity - self.sliding_usage(&st, now)).max(0.0)
            }
        }
    }

    fn sliding_usage(&self, st: &ShardState, now: Instant) -> f64 {
        let window = self.window().as_secs_f64();
        let elapsed = now.saturating_duration_since(st.window_start).as_secs_f64();
        let weight = (1.0 - elapsed / window).clamp(0.0, 1.0);
        st.current_count + st.previous_count * weight
    }

    pub(crate) fn try_take(&self, cost: u32) -> Take {
        let cost = cost as f64;
        if cost > self.capacity + EPSILON {
            return Take::Never;
        }
        let now = Instant::now();
        let mut st = self.lock();
        match self.algorithm {
            Algorithm::TokenBucket => {
                self.refill_locked(&mut st, now);
                if st.debt <= EPSILON && st.tokens + EPSILON >= cost {
                    st.tokens = (st.tokens - cost).max(0.0);
                    st.consumed_since_mark += cost;
                    Take::Taken {
                        remaining: st.tokens,
                    }
                } else {
                    let missing = cost - st.tokens + st.debt;
                    Take::Wait(Duration::from_secs_f64(missing / self.refill_per_second))
                }
            }
            Algorithm::FixedWindow => {
                self.roll_window_locked(&mut st, now);
                if st.current_count + cost <= self.capacity + EPSILON {
                    st.current_count += cost;
                    st.consumed_since_mark += cost;
                    Take::Taken {
                        remaining: self.capacity - st.current_count,
                    }
                } else {
                    let window_end = st.window_start + self.window();
                    Take::Wait(window_end.saturating_duration_since(now))
                }
            }
            Algorithm::SlidingWindow => {
                self.roll_window_locked(&mut st, now);
                let used = self.sliding_usage(&st, now);
                if used + cost <= self.capacity + EPSILON {
                    st.current_count += cost;
                    st.consumed_since_mark += cost;
                    Take::Taken {
                        remaining: self.capacity - used - cost,
                    }
                } else {
                    Take::Wait(self.sliding_wait(&st, now, cost))
                }
            }
        }
    }

    fn sliding_wait(&self, st: &ShardState, now: Instant, cost: f64) -> Duration {
        let window = self.window().as_secs_f64();
        let elapsed = now.saturating_duration_since(st.window_start).as_secs_f64();
        let room = self.capacity - st.current_count - cost;
        let secs = if room >= 0.0 && st.previous_count > 0.0 {
            // previous * (1 - (elapsed + t) / window) <= room
            (window * (1.0 - room / st.previous_count) - elapsed).max(0.0)
        } else {
            // Next window: current becomes previous and decays from there.
            let rest = (window - elapsed).max(0.0);
            let next_room = self.capacity - cost;
            let decay = if st.current_count > 0.0 {
                (window * (1.0 - next_room / st.current_count)).max(0.0)
            } else {
                0.0
            };
            rest + decay
        };
        Duration::from_secs_f64(secs)
    }

    /// Claim `cost` tokens for the earliest serviceable instant after every earlier claim.
    /// No tokens are claimed when the wait would exceed `max_wait`. Reservations that expired
    /// before the claim are purged and returned alongside it.
    pub(crate) fn claim(
        &self,
        cost: u32,
        max_wait: Duration,
        ttl: Duration,
    ) -> (Claim, Vec<(u64, Slot)>) {
        let cost_f = cost as f64;
        if cost_f > self.capacity + EPSILON {
            return (Claim::Never, Vec::new());
        }
        let now = Instant::now();
        let mut st = self.lock();
        self.refill_locked(&mut st, now);
        let expired = self.purge_expired_locked(&mut st, now);

        let wait = if st.debt <= EPSILON && st.tokens + EPSILON >= cost_f {
            Duration::ZERO
        } else {
            let missing = st.debt + cost_f - st.tokens;
            Duration::from_secs_f64(missing / self.refill_per_second)
        };
        if wait > max_wait {
            return (Claim::TooLate { wait }, expired);
        }

        if wait.is_zero() {
            st.tokens = (st.tokens - cost_f).max(0.0);
        } else {
            st.debt += cost_f - st.tokens;
            st.tokens = 0.0;
        }
        st.consumed_since_mark += cost_f;

        // Never schedule before an earlier claim on this shard.
        let floor = st
            .reservations
            .values()
            .next_back()
            .map(|s| s.execute_at)
            .unwrap_or(now);
        let execute_at = (now + wait).max(floor);
        let seq = st.next_seq;
        st.next_seq += 1;
        st.reservations.insert(
            seq,
            Slot {
                tokens: cost,
                execute_at,
                expires_at: execute_at + ttl,
                consumed: false,
            },
        );
        (Claim::Claimed { seq, execute_at }, expired)
    }

    pub(crate) fn redeem(&self, seq: u64) -> Redeem {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill_locked(&mut st, now);
        let Some(slot) = st.reservations.get(&seq).cloned() else {
            return Redeem::Unknown;
        };
        if slot.consumed {
            return Redeem::Consumed;
        }
        if now > slot.expires_at {
            st.reservations.remove(&seq);
            self.release_locked(&mut st, slot.tokens);
            return Redeem::Expired;
        }
        if now < slot.execute_at {
            return Redeem::Pending(slot.execute_at - now);
        }
        if let Some(s) = st.reservations.get_mut(&seq) {
            s.consumed = true;
        }
        Redeem::Granted
    }

    /// Drop an unconsumed claim and give its tokens back.
    pub(crate) fn cancel(&self, seq: u64) -> bool {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill_locked(&mut st, now);
        match st.reservations.get(&seq) {
            Some(slot) if !slot.consumed => {
                let tokens = slot.tokens;
                st.reservations.remove(&seq);
                self.release_locked(&mut st, tokens);
                true
            }
            _ => false,
        }
    }

    fn release_locked(&self, st: &mut ShardState, tokens: u32) {
        let mut amount = tokens as f64;
        let forgiven = amount.min(st.debt);
        st.debt -= forgiven;
        amount -= forgiven;
        st.tokens = (st.tokens + amount).min(self.capacity);
        st.consumed_since_mark = (st.consumed_since_mark - tokens as f64).max(0.0);
    }

    /// Remove slots past `expires_at`; unconsumed ones release their tokens.
    /// Returns the expired, never-executed slots.
    pub(crate) fn purge_expired(&self) -> Vec<(u64, Slot)> {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill_locked(&mut st, now);
        self.purge_expired_locked(&mut st, now)
    }

    fn purge_expired_locked(&self, st: &mut ShardState, now: Instant) -> Vec<(u64, Slot)> {
        let expired: Vec<u64> = st
            .reservations
            .iter()
            .filter(|(_, s)| now > s.expires_at)
            .map(|(seq, _)| *seq)
            .collect();
        let mut dropped = Vec::new();
        for seq in expired {
            if let Some(slot) = st.reservations.remove(&seq) {
                if !slot.consumed {
                    self.release_locked(st, slot.tokens);
                    dropped.push((seq, slot));
                }
            }
        }
        dropped
    }

    pub(crate) fn pending_reservations(&self) -> usize {
        self.lock().reservations.values().filter(|s| !s.consumed).count()
    }

    /// Fraction of the capacity offered since the last mark that was consumed.
    pub(crate) fn utilization(&self) -> f64 {
        let now = Instant::now();
        let st = self.lock();
        let elapsed = now.saturating_duration_since(st.mark_at).as_secs_f64();
        let offered = self.capacity + elapsed * self.refill_per_second;
        (st.consumed_since_mark / offered).clamp(0.0, 1.0)
    }

    pub(crate) fn reset_utilization(&self) {
        let mut st = self.lock();
        st.consumed_since_mark = 0.0;
        st.mark_at = Instant::now();
    }

    /// Refill to capacity and drop every reservation.
    pub(crate) fn reset(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        st.tokens = self.capacity;
        st.debt = 0.0;
        st.last_refill = now;
        st.window_start = now;
        st.current_count = 0.0;
        st.previous_count = 0.0;
        st.reservations.clear();
        st.consumed_since_mark = 0.0;
        st.mark_at = now;
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        let now = Instant::now();
        let mut st = self.lock();
        self.refill_locked(&mut st, now);
        ShardSnapshot {
            shard_id: self.id,
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
            tokens: st.tokens,
            pending_reservations: st.reservations.values().filter(|s| !s.consumed).count(),
            saved_at_ms: crate::unix_millis(),
        }
    }

    /// Restore the token level from a snapshot, crediting refill for wall time since it was
    /// saved. Reservations are not restored.
    pub(crate) fn restore(&self, snap: &ShardSnapshot) {
        let idle_secs = crate::unix_millis().saturating_sub(snap.saved_at_ms) as f64 / 1000.0;
        let mut st = self.lock();
        st.tokens = (snap.tokens + idle_secs * self.refill_per_second).clamp(0.0, self.capacity);
        st.debt = 0.0;
        st.last_refill = Instant::now();
    }
}

impl std::fmt::Debug for TokenBucketShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketShard")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("refill_per_second", &self.refill_per_second)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_never_exceeds_capacity() {
        let shard = TokenBucketShard::new(0, 5.0, 100.0, Algorithm::TokenBucket);
        advance(Duration::from_secs(10)).await;
        assert!((shard.available() - 5.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_wait_estimate() {
        let shard = TokenBucketShard::new(0, 2.0, 4.0, Algorithm::TokenBucket);
        assert!(matches!(shard.try_take(2), Take::Taken { .. }));
        match shard.try_take(1) {
            Take::Wait(wait) => assert_eq!(wait.as_millis(), 250),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(shard.try_take(3), Take::Never);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_are_serialized() {
        let shard = TokenBucketShard::new(0, 2.0, 2.0, Algorithm::TokenBucket);
        let ttl = Duration::from_secs(60);
        let max = Duration::from_secs(10);
        let Claim::Claimed { execute_at: a, .. } = shard.claim(2, max, ttl).0 else {
            panic!("first claim should succeed")
        };
        let Claim::Claimed { execute_at: b, .. } = shard.claim(2, max, ttl).0 else {
            panic!("second claim should succeed")
        };
        let Claim::Claimed { execute_at: c, .. } = shard.claim(1, max, ttl).0 else {
            panic!("third claim should succeed")
        };
        assert!(a < b && b < c);
        assert_eq!((b - a).as_millis(), 1000);
        assert_eq!((c - b).as_millis(), 500);
        // Immediate takes cannot jump the queue.
        assert!(matches!(shard.try_take(1), Take::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_beyond_max_wait_mutates_nothing() {
        let shard = TokenBucketShard::new(0, 1.0, 1.0, Algorithm::TokenBucket);
        assert!(matches!(shard.try_take(1), Take::Taken { .. }));
        let before = shard.available();
        assert!(matches!(
            shard.claim(1, Duration::from_millis(10), Duration::from_secs(1)).0,
            Claim::TooLate { .. }
        ));
        assert_eq!(shard.available(), before);
        assert_eq!(shard.pending_reservations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_tokens() {
        let shard = TokenBucketShard::new(0, 4.0, 1.0, Algorithm::TokenBucket);
        let Claim::Claimed { seq, .. } = shard.claim(3, Duration::ZERO, Duration::from_secs(5)).0 else {
            panic!("claim should succeed")
        };
        assert!((shard.available() - 1.0).abs() < 1e-6);
        assert!(shard.cancel(seq));
        assert!(!shard.cancel(seq));
        assert!((shard.available() - 4.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets_on_boundary() {
        // window = 3 / 3 = 1s
        let shard = TokenBucketShard::new(0, 3.0, 3.0, Algorithm::FixedWindow);
        for _ in 0..3 {
            assert!(matches!(shard.try_take(1), Take::Taken { .. }));
        }
        advance(Duration::from_millis(400)).await;
        match shard.try_take(1) {
            Take::Wait(w) => assert_eq!(w.as_millis(), 600),
            other => panic!("unexpected {other:?}"),
        }
        advance(Duration::from_millis(600)).await;
        assert!(matches!(shard.try_take(3), Take::Taken { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_weights_previous() {
        let shard = TokenBucketShard::new(0, 4.0, 4.0, Algorithm::SlidingWindow);
        for _ in 0..4 {
            assert!(matches!(shard.try_take(1), Take::Taken { .. }));
        }
        // Halfway into the next window, half of the previous window still counts.
        advance(Duration::from_millis(1500)).await;
        assert!((shard.available() - 2.0).abs() < 1e-6);
        assert!(matches!(shard.try_take(2), Take::Taken { .. }));
        assert!(matches!(shard.try_take(1), Take::Wait(_)));
    }
}
