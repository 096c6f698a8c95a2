//! Per-key single-flight registry.
//!
//! The registry only holds weak handles: a load lives exactly as long as at least one caller
//! is awaiting it, so when every waiter is dropped the loader future is dropped too.

use crate::Error;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type LoadResult = std::result::Result<Bytes, Arc<Error>>;
pub(crate) type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Default)]
pub(crate) struct FlightGroup {
    inflight: Mutex<HashMap<String, (u64, WeakShared<BoxFuture<'static, LoadResult>>)>>,
    next_generation: Mutex<u64>,
}

pub(crate) struct Joined {
    pub load: SharedLoad,
    /// `true` when this caller started the load.
    pub leader: bool,
    pub generation: u64,
}

impl FlightGroup {
    fn lock(
        &self,
    ) -> MutexGuard<'_, HashMap<String, (u64, WeakShared<BoxFuture<'static, LoadResult>>)>> {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_generation(&self) -> u64 {
        let mut g = self.next_generation.lock().unwrap_or_else(|p| p.into_inner());
        *g += 1;
        *g
    }

    /// Join the live load for `key`, or start one with `start(generation)`.
    pub fn join<F>(&self, key: &str, start: F) -> Joined
    where
        F: FnOnce(u64) -> BoxFuture<'static, LoadResult>,
    {
        let mut inflight = self.lock();
        if let Some((generation, weak)) = inflight.get(key) {
            if let Some(load) = weak.upgrade() {
                return Joined {
                    load,
                    leader: false,
                    generation: *generation,
                };
            }
        }
        let generation = self.next_generation();
        let load = start(generation).shared();
        if let Some(weak) = load.downgrade() {
            inflight.insert(key.to_string(), (generation, weak));
        }
        Joined {
            load,
            leader: true,
            generation,
        }
    }

    /// Forget the load for `key` if it is still the one identified by `generation`.
    pub fn finish(&self, key: &str, generation: u64) {
        let mut inflight = self.lock();
        if matches!(inflight.get(key), Some((g, _)) if *g == generation) {
            inflight.remove(key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock()
            .values()
            .filter(|(_, weak)| weak.upgrade().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrent_joins_share_one_load() {
        let group = FlightGroup::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let start = |s: Arc<AtomicUsize>| {
            move |_: u64| {
                s.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Arc<Error>>(Bytes::from_static(b"v")) }.boxed()
            }
        };
        let a = group.join("k", start(starts.clone()));
        let b = group.join("k", start(starts.clone()));
        assert!(a.leader && !b.leader);
        let (ra, rb) = tokio::join!(a.load, b.load);
        assert_eq!(ra.unwrap(), rb.unwrap());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_waiters_allow_restart() {
        let group = FlightGroup::default();
        let first = group.join("k", |_| futures::future::pending::<LoadResult>().boxed());
        drop(first);
        assert_eq!(group.in_flight(), 0);
        let second = group.join("k", |_| async { Ok::<_, Arc<Error>>(Bytes::new()) }.boxed());
        assert!(second.leader);
    }
}
