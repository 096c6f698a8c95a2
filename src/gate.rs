//! `ResilienceGate`: the full request path in one call.
//!
//! limiter → cache-aside → circuit breaker → operation, with failures handed to the
//! recovery manager. A retry re-enters the gate from the limiter.
//!
//! Only a call that reaches the upstream is counted by the breaker. Cache hits, and callers
//! joining a load already in flight, leave it untouched, so half-open trials are always
//! real upstream calls.
//!
//! Every upstream call already runs inside the service's breaker, so the gate's recovery
//! manager has no breaker registry of its own: errors that select the circuit-break strategy go straight
//! to the fallbacks instead of being counted twice.

use crate::cache::{CacheBackend, MultiTierCache};
use crate::config::ResilienceConfig;
use crate::events::{noop_sink, EventSink};
use crate::persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
use crate::recovery::{ErrorRecoveryManager, RecoveryContext};
use crate::resilience::{CircuitBreakerRegistry, ShardedRateLimiter};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One upstream call as seen by the gate.
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Rate-limit key (user, tenant, API key ...).
    pub key: String,
    /// Circuit breaker name.
    pub service: String,
    pub cost: u32,
    /// Cache the result under this key; uncached when `None`.
    pub cache_key: Option<String>,
    /// TTL for a freshly loaded result; the cache default when `None`.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl GateRequest {
    pub fn new(key: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            service: service.into(),
            cost: 1,
            cache_key: None,
            ttl: None,
            tags: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

pub struct ResilienceGate {
    limiter: Arc<ShardedRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: MultiTierCache,
    recovery: ErrorRecoveryManager,
    store: Arc<dyn StateStore>,
}

impl ResilienceGate {
    pub fn builder(config: ResilienceConfig) -> ResilienceGateBuilder {
        ResilienceGateBuilder::new(config)
    }

    pub fn limiter(&self) -> &ShardedRateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &MultiTierCache {
        &self.cache
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    /// Run `op` through the gate. A failure is recovered with the request's service and, when
    /// cached, a stale read of its cache key as the fallback.
    pub async fn call<T, Op, Fut>(&self, request: &GateRequest, op: Op) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut context = RecoveryContext::new().with_service(request.service.clone());
        if let Some(key) = &request.cache_key {
            context = context.with_cache_key(key.clone());
        }
        self.call_with(request, op, context).await
    }

    /// Like [`call`](Self::call) with caller-supplied fallbacks.
    pub async fn call_with<T, Op, Fut>(
        &self,
        request: &GateRequest,
        op: Op,
        context: RecoveryContext<T>,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let op = &op;
        let context = context.with_context("rate_limit_key", request.key.clone());
        self.recovery
            .execute(|| self.pass(request, op), context)
            .await
    }

    async fn pass<T, Op, Fut>(&self, request: &GateRequest, op: &Op) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let admission = self.limiter.try_acquire(&request.key, request.cost)?;
        debug!(
            key = request.key.as_str(),
            shard_id = admission.shard_id,
            remaining = admission.remaining,
            "gate admitted request"
        );
        let breaker = self.breakers.breaker(&request.service);
        match &request.cache_key {
            Some(cache_key) => {
                let ttl = request
                    .ttl
                    .unwrap_or_else(|| self.cache.config().default_ttl());
                let tags: Vec<&str> = request.tags.iter().map(String::as_str).collect();
                let load = || {
                    let started = breaker.permit().map(|permit| (permit, op()));
                    async move {
                        let (permit, upstream) = started?;
                        permit.record(upstream.await)
                    }
                };
                self.cache.get_tagged(cache_key, &tags, load, ttl).await
            }
            None => breaker.call(|| op()).await,
        }
    }

    /// Save every shard snapshot to the gate's state store.
    pub fn persist(&self) -> Result<()> {
        self.limiter.persist(self.store.as_ref())
    }

    /// Start the cache's periodic expiry sweep.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper()
    }
}

impl std::fmt::Debug for ResilienceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceGate")
            .field("limiter", &self.limiter)
            .field("recovery", &self.recovery)
            .finish()
    }
}

pub struct ResilienceGateBuilder {
    config: ResilienceConfig,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn StateStore>>,
    backend: Option<Arc<dyn CacheBackend>>,
}

impl ResilienceGateBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            sink: noop_sink(),
            store: None,
            backend: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// State store for breakers and shard snapshots; overrides `state_dir`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// L2 backend; overrides `cache.l2_dir`.
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Validate the config, open stores and restore persisted shard state.
    pub async fn build(self) -> Result<ResilienceGate> {
        self.config.validate()?;
        let store: Arc<dyn StateStore> = match (self.store, &self.config.state_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(JsonFileStateStore::open(dir.clone())?),
            (None, None) => MemoryStateStore::shared(),
        };

        let limiter = ShardedRateLimiter::new(self.config.rate_limiter.clone())?
            .with_sink(self.sink.clone());
        let restored = limiter.restore(store.as_ref())?;
        if restored > 0 {
            debug!(restored, "restored rate limiter shards");
        }

        let mut breakers = CircuitBreakerRegistry::new(self.config.circuit_breaker.default.clone())?
            .with_store(store.clone())
            .with_sink(self.sink.clone());
        for (service, config) in &self.config.circuit_breaker.services {
            breakers = breakers.with_override(service.clone(), config.clone())?;
        }
        let breakers = Arc::new(breakers);

        let mut cache = MultiTierCache::builder(self.config.cache.clone()).sink(self.sink.clone());
        if let Some(backend) = self.backend {
            cache = cache.backend(backend);
        }
        let cache = cache.build().await?;

        let recovery = ErrorRecoveryManager::new(self.config.retry.clone())
            .with_cache(cache.clone())
            .with_sink(self.sink);

        Ok(ResilienceGate {
            limiter: Arc::new(limiter),
            breakers,
            cache,
            recovery,
            store,
        })
    }
}
