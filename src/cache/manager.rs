//! Multi-tier cache manager.

use super::backend::{CacheBackend, CacheEntry, EntryMeta, FileBackend, MemoryBackend};
use super::compression::Compression;
use super::flight::{FlightGroup, LoadResult};
use super::memory::{EvictionPolicy, Evicted, L1Entry, Lookup, MemoryTier};
use crate::events::{
    noop_sink, timestamp, CacheEvictionEvent, CacheTier, EventSink, EvictionReason,
    ResilienceEvent,
};
use crate::{Error, ErrorContext, Result};
use bytes::Bytes;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// L1 entry bound.
    pub max_entries: usize,
    /// L1 memory bound (keys + decoded values).
    pub max_memory_mb: f64,
    pub eviction: EvictionPolicy,
    /// Codec for L2 payloads.
    pub compression: Compression,
    pub default_ttl_ms: u64,
    /// Expired entries remain readable through `get_stale` for this long.
    pub stale_grace_ms: u64,
    /// L2 stored-bytes bound.
    pub l2_quota_mb: f64,
    /// Directory for the file-backed L2; in-memory L2 when unset.
    pub l2_dir: Option<PathBuf>,
    pub sweep_interval_ms: u64,
    /// Values whose encoded form is larger than this are returned but not cached.
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            max_memory_mb: 64.0,
            eviction: EvictionPolicy::Lru,
            compression: Compression::Lz4,
            default_ttl_ms: 3_600_000,
            stale_grace_ms: 300_000,
            l2_quota_mb: 512.0,
            l2_dir: None,
            sweep_interval_ms: 60_000,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = policy;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_l2_quota_mb(mut self, mb: f64) -> Self {
        self.l2_quota_mb = mb;
        self
    }

    pub fn with_l2_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.l2_dir = Some(dir.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(format!("cache.{}", field))
                    .with_source("cache"),
            ))
        };
        if self.max_entries == 0 {
            return invalid("max_entries", "max_entries must be at least 1");
        }
        if !(self.max_memory_mb > 0.0) {
            return invalid("max_memory_mb", "max_memory_mb must be positive");
        }
        if !(self.l2_quota_mb > 0.0) {
            return invalid("l2_quota_mb", "l2_quota_mb must be positive");
        }
        if self.sweep_interval_ms == 0 {
            return invalid("sweep_interval_ms", "sweep_interval_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub stale_hits: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l2_entries: usize,
    pub l2_bytes: u64,
    /// Decoded bytes minus stored bytes, summed over L2 writes.
    pub compression_savings_bytes: u64,
    pub in_flight_loads: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    stale_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    compression_savings: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of [`MultiTierCache::warm`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmReport {
    pub loaded: usize,
    pub skipped: usize,
    /// `(key, error message)` for loads that failed.
    pub failed: Vec<(String, String)>,
}

struct CacheInner {
    config: CacheConfig,
    l1: MemoryTier,
    l2: Arc<dyn CacheBackend>,
    flights: FlightGroup,
    stats: AtomicStats,
    sink: Arc<dyn EventSink>,
}

impl CacheInner {
    fn emit_evictions(&self, tier: CacheTier, evicted: Vec<Evicted>) {
        for e in evicted {
            bump(&self.stats.evictions);
            tracing::debug!(key = e.key.as_str(), tier = ?tier, reason = ?e.reason, "cache eviction");
            self.sink.emit(ResilienceEvent::CacheEvicted(CacheEvictionEvent {
                key: e.key,
                tier,
                reason: e.reason,
                size_bytes: e.size_bytes,
                timestamp: timestamp(),
            }));
        }
    }

    /// Fresh bytes from L1, then L2 (promoting into L1).
    async fn lookup(&self, key: &str, record: bool) -> Option<Bytes> {
        let now = crate::unix_millis();
        match self.l1.get(key, now, self.config.stale_grace_ms) {
            Lookup::Hit(bytes) => {
                if record {
                    bump(&self.stats.l1_hits);
                }
                return Some(bytes);
            }
            Lookup::Expired { purged: Some(e) } => self.emit_evictions(CacheTier::L1, vec![e]),
            Lookup::Expired { purged: None } | Lookup::Miss => {}
        }

        let entry = match self.l2.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                bump(&self.stats.errors);
                tracing::warn!(key, backend = self.l2.name(), error = %e, "L2 read failed");
                return None;
            }
        };
        if entry.meta.is_expired(now) {
            if entry.meta.expires_at_ms.saturating_add(self.config.stale_grace_ms) <= now {
                self.drop_l2(&entry.meta, EvictionReason::Expired).await;
            }
            return None;
        }
        match entry.meta.compression.decompress(&entry.payload) {
            Ok(decoded) => {
                let bytes = Bytes::from(decoded);
                let evicted = self.l1.insert(
                    key,
                    L1Entry {
                        value: bytes.clone(),
                        expires_at_ms: entry.meta.expires_at_ms,
                        hits: 0,
                        tags: entry.meta.tags.clone(),
                    },
                );
                self.emit_evictions(CacheTier::L1, evicted);
                if record {
                    bump(&self.stats.l2_hits);
                }
                Some(bytes)
            }
            Err(e) => {
                bump(&self.stats.errors);
                tracing::warn!(key, error = %e, "dropping undecodable L2 entry");
                let _ = self.l2.delete(key).await;
                None
            }
        }
    }

    async fn drop_l2(&self, meta: &EntryMeta, reason: EvictionReason) {
        match self.l2.delete(&meta.key).await {
            Ok(true) => self.emit_evictions(
                CacheTier::L2,
                vec![Evicted {
                    key: meta.key.clone(),
                    size_bytes: meta.size_bytes,
                    reason,
                }],
            ),
            Ok(false) => {}
            Err(e) => {
                bump(&self.stats.errors);
                tracing::warn!(key = meta.key.as_str(), error = %e, "L2 delete failed");
            }
        }
    }

    /// Write decoded bytes to both tiers. L2 failures are logged, not returned.
    async fn store(&self, key: &str, bytes: Bytes, ttl: Duration, tags: Vec<String>) {
        if bytes.len() > self.config.max_entry_size {
            tracing::debug!(key, size = bytes.len(), "value too large to cache");
            return;
        }
        let now = crate::unix_millis();
        let expires_at_ms = now.saturating_add(ttl.as_millis() as u64);
        let evicted = self.l1.insert(
            key,
            L1Entry {
                value: bytes.clone(),
                expires_at_ms,
                hits: 0,
                tags: tags.clone(),
            },
        );
        self.emit_evictions(CacheTier::L1, evicted);
        bump(&self.stats.sets);

        let codec = self.config.compression;
        let payload = match codec.compress(&bytes) {
            Ok(p) => p,
            Err(e) => {
                bump(&self.stats.errors);
                tracing::warn!(key, codec = codec.name(), error = %e, "L2 compression failed");
                return;
            }
        };
        self.stats.compression_savings.fetch_add(
            (bytes.len() as u64).saturating_sub(payload.len() as u64),
            Ordering::Relaxed,
        );
        let entry = CacheEntry {
            meta: EntryMeta {
                key: key.to_string(),
                compression: codec,
                original_size: bytes.len(),
                size_bytes: payload.len(),
                created_at_ms: now,
                expires_at_ms,
                hit_count: 0,
                tags,
            },
            payload: Bytes::from(payload),
        };
        if let Err(e) = self.l2.put(entry).await {
            bump(&self.stats.errors);
            tracing::warn!(key, backend = self.l2.name(), error = %e, "L2 write failed");
            return;
        }
        self.enforce_quota(key).await;
    }

    /// Evict L2 entries (expired first, then least hit, then oldest) until under quota.
    /// The entry just written (`protect`) is never chosen.
    async fn enforce_quota(&self, protect: &str) {
        let quota = (self.config.l2_quota_mb * MB) as u64;
        let mut total = match self.l2.total_bytes().await {
            Ok(t) if t > quota => t,
            _ => return,
        };
        let mut metas: Vec<EntryMeta> = match self.l2.entries().await {
            Ok(m) => m.into_iter().filter(|m| m.key != protect).collect(),
            Err(_) => return,
        };
        let now = crate::unix_millis();
        metas.sort_by_key(|m| (!m.is_expired(now), m.hit_count, m.created_at_ms));
        for meta in metas {
            if total <= quota {
                break;
            }
            let reason = if meta.is_expired(now) {
                EvictionReason::Expired
            } else {
                EvictionReason::Quota
            };
            total = total.saturating_sub(meta.size_bytes as u64);
            self.drop_l2(&meta, reason).await;
        }
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = crate::unix_millis();
        let cutoff = now.saturating_sub(self.config.stale_grace_ms);
        let evicted = self.l1.purge_expired(cutoff);
        let mut purged = evicted.len();
        self.emit_evictions(CacheTier::L1, evicted);
        for meta in self.l2.entries().await? {
            if meta.expires_at_ms <= cutoff {
                self.drop_l2(&meta, EvictionReason::Expired).await;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Two-tier cache: decoded values in process memory (L1), compressed entries in a
/// persistent backend (L2).
///
/// `get` is cache-aside with single-flight loading: concurrent callers for the same key share
/// one loader invocation. The loader runs inside the callers' own tasks, so it is cancelled
/// when the last waiting caller goes away.
#[derive(Clone)]
pub struct MultiTierCache {
    inner: Arc<CacheInner>,
}

pub struct MultiTierCacheBuilder {
    config: CacheConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    sink: Arc<dyn EventSink>,
}

impl MultiTierCacheBuilder {
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the config and open the L2 backend (a [`FileBackend`] when `l2_dir` is set).
    pub async fn build(self) -> Result<MultiTierCache> {
        self.config.validate()?;
        let backend: Arc<dyn CacheBackend> = match (self.backend, &self.config.l2_dir) {
            (Some(b), _) => b,
            (None, Some(dir)) => Arc::new(FileBackend::open(dir.clone()).await?),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        Ok(MultiTierCache::assemble(self.config, backend, self.sink))
    }
}

impl MultiTierCache {
    pub fn builder(config: CacheConfig) -> MultiTierCacheBuilder {
        MultiTierCacheBuilder {
            config,
            backend: None,
            sink: noop_sink(),
        }
    }

    /// Cache with an in-memory L2.
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, Arc::new(MemoryBackend::new()), noop_sink()))
    }

    fn assemble(config: CacheConfig, l2: Arc<dyn CacheBackend>, sink: Arc<dyn EventSink>) -> Self {
        let max_bytes = (config.max_memory_mb * MB) as usize;
        Self {
            inner: Arc::new(CacheInner {
                l1: MemoryTier::new(config.eviction, config.max_entries, max_bytes),
                l2,
                flights: FlightGroup::default(),
                stats: AtomicStats::default(),
                sink,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.l2.name()
    }

    fn full_key(&self, key: &str) -> String {
        match &self.inner.config.key_prefix {
            Some(p) => format!("{}:{}", p, key),
            None => key.to_string(),
        }
    }

    /// Cached value for `key`, or the loader's result (stored in both tiers with `ttl`).
    pub async fn get<T, F, Fut>(&self, key: &str, loader: F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fetch(key, loader, ttl, Vec::new(), None).await
    }

    /// Like [`get`](Self::get), tagging a freshly loaded value.
    pub async fn get_tagged<T, F, Fut>(
        &self,
        key: &str,
        tags: &[&str],
        loader: F,
        ttl: Duration,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.fetch(key, loader, ttl, tags, None).await
    }

    /// Like [`get`](Self::get), but this caller stops waiting after `timeout`. The load keeps
    /// running for any other waiters.
    pub async fn get_with_timeout<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fetch(key, loader, ttl, Vec::new(), Some(timeout)).await
    }

    async fn fetch<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Duration,
        tags: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.inner.config.enabled {
            return loader().await;
        }
        let full_key = self.full_key(key);
        if let Some(bytes) = self.inner.lookup(&full_key, true).await {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        bump(&self.inner.stats.misses);

        let inner = self.inner.clone();
        let load_key = full_key.clone();
        let joined = self.inner.flights.join(&full_key, move |generation| {
            let pending = loader();
            async move {
                let result: LoadResult = match pending.await {
                    Ok(value) => match serde_json::to_vec(&value) {
                        Ok(encoded) => {
                            let bytes = Bytes::from(encoded);
                            inner.store(&load_key, bytes.clone(), ttl, tags).await;
                            Ok(bytes)
                        }
                        Err(e) => Err(Arc::new(Error::from(e))),
                    },
                    Err(e) => Err(Arc::new(e)),
                };
                if result.is_err() {
                    bump(&inner.stats.load_failures);
                }
                inner.flights.finish(&load_key, generation);
                result
            }
            .boxed()
        });
        if joined.leader {
            bump(&self.inner.stats.loads);
            tracing::debug!(key = full_key.as_str(), generation = joined.generation, "cache load started");
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, joined.load).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: format!("cache load '{}'", key),
                        elapsed_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => joined.load.await,
        };
        match outcome {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(source) => Err(Error::CacheLoad {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Store `value` in both tiers.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: &[&str],
    ) -> Result<()> {
        if !self.inner.config.enabled {
            return Ok(());
        }
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.inner.store(&self.full_key(key), bytes, ttl, tags).await;
        Ok(())
    }

    /// Fresh cached value without invoking any loader.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.inner.config.enabled {
            return Ok(None);
        }
        match self.inner.lookup(&self.full_key(key), false).await {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Cached value even if expired (within the stale grace period). Used for fallbacks.
    pub async fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.inner.config.enabled {
            return Ok(None);
        }
        let full_key = self.full_key(key);
        let cutoff = crate::unix_millis().saturating_sub(self.inner.config.stale_grace_ms);
        let bytes = match self.inner.l1.peek_stale(&full_key, cutoff) {
            Some(b) => Some(b),
            None => match self.inner.l2.get(&full_key).await? {
                Some(entry) if entry.meta.expires_at_ms > cutoff => Some(Bytes::from(
                    entry.meta.compression.decompress(&entry.payload)?,
                )),
                _ => None,
            },
        };
        match bytes {
            Some(b) => {
                bump(&self.inner.stats.stale_hits);
                Ok(Some(serde_json::from_slice(&b)?))
            }
            None => Ok(None),
        }
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let in_l1 = self.inner.l1.remove(&full_key);
        let in_l2 = self.inner.l2.delete(&full_key).await?;
        if in_l1 || in_l2 {
            bump(&self.inner.stats.deletes);
        }
        Ok(in_l1 || in_l2)
    }

    /// Remove every entry carrying `tag` from both tiers; returns the number of keys removed.
    pub async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let mut keys: HashSet<String> = self.inner.l1.remove_tagged(tag).into_iter().collect();
        keys.extend(self.inner.l2.delete_by_tag(tag).await?);
        self.inner
            .stats
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        tracing::debug!(tag, removed = keys.len(), "cache tag invalidated");
        Ok(keys.len())
    }

    /// Drop entries past their expiry plus the stale grace period.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.inner.l1.clear();
        self.inner.l2.clear().await
    }

    /// Load every missing key outside the request path. Existing fresh entries are skipped.
    pub async fn warm<T, I, F, Fut>(&self, keys: I, loader: F, ttl: Duration) -> WarmReport
    where
        I: IntoIterator<Item = String>,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut report = WarmReport::default();
        for key in keys {
            if self.inner.lookup(&self.full_key(&key), false).await.is_some() {
                report.skipped += 1;
                continue;
            }
            let load = loader(key.clone());
            match self.get::<T, _, _>(&key, move || load, ttl).await {
                Ok(_) => report.loaded += 1,
                Err(e) => report.failed.push((key, e.to_string())),
            }
        }
        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed.len(),
            "cache warming finished"
        );
        report
    }

    /// Periodically purge expired entries until the cache is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                match inner.purge_expired().await {
                    Ok(n) if n > 0 => tracing::debug!(purged = n, "cache sweep"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
                }
            }
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let s = &self.inner.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            l1_hits: load(&s.l1_hits),
            l2_hits: load(&s.l2_hits),
            misses: load(&s.misses),
            loads: load(&s.loads),
            load_failures: load(&s.load_failures),
            stale_hits: load(&s.stale_hits),
            sets: load(&s.sets),
            deletes: load(&s.deletes),
            evictions: load(&s.evictions),
            errors: load(&s.errors),
            l1_entries: self.inner.l1.len(),
            l1_bytes: self.inner.l1.bytes(),
            l2_entries: self.inner.l2.len().await.unwrap_or(0),
            l2_bytes: self.inner.l2.total_bytes().await.unwrap_or(0),
            compression_savings_bytes: load(&s.compression_savings),
            in_flight_loads: self.inner.flights.in_flight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventSink;

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let backend = Arc::new(MemoryBackend::new());
        let first = MultiTierCache::builder(CacheConfig::default())
            .backend(backend.clone())
            .build()
            .await
            .unwrap();
        first
            .set("k", &"value".to_string(), Duration::from_secs(60), &[])
            .await
            .unwrap();

        // fresh L1 over the same L2
        let second = MultiTierCache::builder(CacheConfig::default())
            .backend(backend)
            .build()
            .await
            .unwrap();
        let v: Option<String> = second.peek("k").await.unwrap();
        assert_eq!(v.as_deref(), Some("value"));
        let v: String = second
            .get("k", || async { Ok("loaded".to_string()) }, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(v, "value");
        let stats = second.stats().await;
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.loads, 0);
    }

    #[tokio::test]
    async fn test_l2_quota_evicts_least_hit() {
        let sink = Arc::new(InMemoryEventSink::default());
        let config = CacheConfig::new()
            .with_compression(Compression::None)
            .with_l2_quota_mb(250.0 / MB);
        let cache = MultiTierCache::builder(config)
            .sink(sink.clone())
            .build()
            .await
            .unwrap();
        let blob = "x".repeat(100);
        cache.set("a", &blob, Duration::from_secs(60), &[]).await.unwrap();
        cache.set("b", &blob, Duration::from_secs(60), &[]).await.unwrap();
        cache.clear_l1_for_test();
        let _: Option<String> = cache.peek("a").await.unwrap();
        cache.set("c", &blob, Duration::from_secs(60), &[]).await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.l2_entries, 2);
        let evicted: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ResilienceEvent::CacheEvicted(c) if c.tier == CacheTier::L2 => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert_eq!(evicted[0].reason, EvictionReason::Quota);
    }

    #[tokio::test]
    async fn test_compression_savings_reported() {
        let cache = MultiTierCache::in_memory(CacheConfig::new().with_compression(Compression::Gzip)).unwrap();
        let text = "resilience ".repeat(500);
        cache.set("k", &text, Duration::from_secs(60), &[]).await.unwrap();
        let stats = cache.stats().await;
        assert!(stats.compression_savings_bytes > 4_000);
        assert!(stats.l2_bytes < stats.l1_bytes as u64);
    }

    #[tokio::test]
    async fn test_disabled_cache_calls_loader() {
        let cache = MultiTierCache::in_memory(CacheConfig::new().with_enabled(false)).unwrap();
        for _ in 0..2 {
            let v: u32 = cache
                .get("k", || async { Ok(1) }, Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(v, 1);
        }
        assert_eq!(cache.stats().await.l1_entries, 0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(MultiTierCache::in_memory(CacheConfig::new().with_max_entries(0)).is_err());
        assert!(MultiTierCache::in_memory(CacheConfig::new().with_l2_quota_mb(0.0)).is_err());
    }

    impl MultiTierCache {
        fn clear_l1_for_test(&self) {
            self.inner.l1.clear();
        }
    }
}
