//! L1: in-process tier holding decoded values.

use crate::events::EvictionReason;
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
}

#[derive(Debug, Clone)]
pub(crate) struct L1Entry {
    pub value: Bytes,
    pub expires_at_ms: u64,
    pub hits: u64,
    pub tags: Vec<String>,
}

impl L1Entry {
    fn size(&self, key: &str) -> usize {
        key.len() + self.value.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Evicted {
    pub key: String,
    pub size_bytes: usize,
    pub reason: EvictionReason,
}

pub(crate) enum Lookup {
    Hit(Bytes),
    /// Past `expires_at`; `purged` is set when the entry was also past its grace period.
    Expired { purged: Option<Evicted> },
    Miss,
}

struct State {
    entries: LruCache<String, L1Entry>,
    bytes: usize,
}

pub(crate) struct MemoryTier {
    state: Mutex<State>,
    policy: EvictionPolicy,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryTier {
    pub fn new(policy: EvictionPolicy, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            policy,
            max_entries,
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fresh value for `key`. Entries expired for longer than `grace_ms` are dropped here;
    /// younger expired entries stay available to [`MemoryTier::peek_stale`].
    pub fn get(&self, key: &str, now_ms: u64, grace_ms: u64) -> Lookup {
        let mut st = self.lock();
        let expires_at_ms = match st.entries.get_mut(key) {
            Some(entry) if entry.expires_at_ms > now_ms => {
                entry.hits += 1;
                return Lookup::Hit(entry.value.clone());
            }
            Some(entry) => entry.expires_at_ms,
            None => return Lookup::Miss,
        };
        if expires_at_ms.saturating_add(grace_ms) > now_ms {
            return Lookup::Expired { purged: None };
        }
        let purged = st.entries.pop(key).map(|old| {
            let size_bytes = old.size(key);
            st.bytes -= size_bytes;
            Evicted {
                key: key.to_string(),
                size_bytes,
                reason: EvictionReason::Expired,
            }
        });
        Lookup::Expired { purged }
    }

    /// Value that expired after `cutoff_ms` (or is still fresh), without touching recency
    /// or hit counts.
    pub fn peek_stale(&self, key: &str, cutoff_ms: u64) -> Option<Bytes> {
        self.lock()
            .entries
            .peek(key)
            .filter(|e| e.expires_at_ms > cutoff_ms)
            .map(|e| e.value.clone())
    }

    pub fn insert(&self, key: &str, entry: L1Entry) -> Vec<Evicted> {
        let mut st = self.lock();
        let size = entry.size(key);
        if let Some(old) = st.entries.put(key.to_string(), entry) {
            st.bytes -= old.size(key);
        }
        st.bytes += size;
        self.evict_locked(&mut st)
    }

    fn evict_locked(&self, st: &mut State) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        while !st.entries.is_empty()
            && (st.entries.len() > self.max_entries || st.bytes > self.max_bytes)
        {
            let reason = if st.entries.len() > self.max_entries {
                EvictionReason::Capacity
            } else {
                EvictionReason::Memory
            };
            let victim = match self.policy {
                EvictionPolicy::Lru => st.entries.pop_lru(),
                EvictionPolicy::Lfu => {
                    // least recently used among the least hit; the newest entry is exempt
                    let candidates = st.entries.len().saturating_sub(1).max(1);
                    let key = st
                        .entries
                        .iter()
                        .rev()
                        .take(candidates)
                        .min_by_key(|(_, e)| e.hits)
                        .map(|(k, _)| k.clone());
                    key.and_then(|k| st.entries.pop_entry(&k))
                }
            };
            let Some((key, entry)) = victim else { break };
            let size_bytes = entry.size(&key);
            st.bytes -= size_bytes;
            evicted.push(Evicted {
                key,
                size_bytes,
                reason,
            });
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut st = self.lock();
        match st.entries.pop(key) {
            Some(old) => {
                st.bytes -= old.size(key);
                true
            }
            None => false,
        }
    }

    pub fn remove_tagged(&self, tag: &str) -> Vec<String> {
        let mut st = self.lock();
        let keys: Vec<String> = st
            .entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| t == tag))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(old) = st.entries.pop(key) {
                st.bytes -= old.size(key);
            }
        }
        keys
    }

    /// Drop entries whose expiry is at or before `cutoff_ms`.
    pub fn purge_expired(&self, cutoff_ms: u64) -> Vec<Evicted> {
        let mut st = self.lock();
        let keys: Vec<String> = st
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at_ms <= cutoff_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(old) = st.entries.pop(&key) {
                let size_bytes = old.size(&key);
                st.bytes -= size_bytes;
                out.push(Evicted {
                    key,
                    size_bytes,
                    reason: EvictionReason::Expired,
                });
            }
        }
        out
    }

    pub fn clear(&self) {
        let mut st = self.lock();
        st.entries.clear();
        st.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: &str, expires_at_ms: u64) -> L1Entry {
        L1Entry {
            value: Bytes::from(value.to_string()),
            expires_at_ms,
            hits: 0,
            tags: vec![],
        }
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let tier = MemoryTier::new(EvictionPolicy::Lru, 2, usize::MAX);
        tier.insert("a", entry("1", u64::MAX));
        tier.insert("b", entry("2", u64::MAX));
        assert!(matches!(tier.get("a", 0, 0), Lookup::Hit(_)));
        let evicted = tier.insert("c", entry("3", u64::MAX));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert_eq!(evicted[0].reason, EvictionReason::Capacity);
    }

    #[test]
    fn test_lfu_evicts_least_hit() {
        let tier = MemoryTier::new(EvictionPolicy::Lfu, 2, usize::MAX);
        tier.insert("a", entry("1", u64::MAX));
        tier.insert("b", entry("2", u64::MAX));
        for _ in 0..3 {
            tier.get("a", 0, 0);
        }
        tier.get("b", 0, 0);
        tier.get("b", 0, 0);
        tier.get("a", 0, 0);
        // "b" was touched last but has fewer hits
        let evicted = tier.insert("c", entry("3", u64::MAX));
        assert_eq!(evicted[0].key, "b");
    }

    #[test]
    fn test_memory_bound() {
        let tier = MemoryTier::new(EvictionPolicy::Lru, 100, 10);
        tier.insert("a", entry("1234", u64::MAX));
        let evicted = tier.insert("b", entry("123456", u64::MAX));
        assert_eq!(evicted[0].key, "a");
        assert_eq!(evicted[0].reason, EvictionReason::Memory);
        assert_eq!(tier.bytes(), 7);
    }

    #[test]
    fn test_expired_kept_for_stale_reads() {
        let tier = MemoryTier::new(EvictionPolicy::Lru, 10, usize::MAX);
        tier.insert("a", entry("old", 100));
        assert!(matches!(
            tier.get("a", 200, 1_000),
            Lookup::Expired { purged: None }
        ));
        assert_eq!(tier.peek_stale("a", 0).as_deref(), Some(&b"old"[..]));
        assert!(tier.peek_stale("a", 100).is_none());
        assert_eq!(tier.purge_expired(200).len(), 1);
        assert!(tier.peek_stale("a", 0).is_none());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_expired_past_grace_dropped_on_read() {
        let tier = MemoryTier::new(EvictionPolicy::Lru, 10, usize::MAX);
        tier.insert("a", entry("old", 100));
        match tier.get("a", 500, 100) {
            Lookup::Expired { purged: Some(e) } => assert_eq!(e.reason, EvictionReason::Expired),
            _ => panic!("expected purge"),
        }
        assert_eq!(tier.len(), 0);
    }
}
