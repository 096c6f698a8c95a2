//! # ai-lib-resilience
//!
//! 面向高成本推理 API 的弹性与吞吐控制层：分片限流、熔断、多级缓存与错误恢复。
//!
//! Resilience and throughput control for costly, rate-limited inference APIs.
//!
//! ## Overview
//!
//! A request passes four gates, each usable on its own:
//!
//! 1. [`ShardedRateLimiter`] admits it (or says how long to wait),
//! 2. the service's [`CircuitBreaker`] lets it through unless the upstream is failing,
//! 3. [`MultiTierCache`] answers it from memory or disk, loading at most once per key,
//! 4. on failure, [`ErrorRecoveryManager`] retries, trips the breaker or falls back.
//!
//! [`ResilienceGate`] wires all four together from one [`ResilienceConfig`].
//!
//! ## Quick Start
//!
//! ```rust
//! use ai_lib_resilience::{GateRequest, ResilienceConfig, ResilienceGate};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_lib_resilience::Result<()> {
//! let gate = ResilienceGate::builder(ResilienceConfig::default()).build().await?;
//! let request = GateRequest::new("user-42", "dictionary")
//!     .with_cache_key("definition:ephemeral")
//!     .with_ttl(Duration::from_secs(3600));
//! let definition: String = gate
//!     .call(&request, || async { Ok("lasting a very short time".to_string()) })
//!     .await?;
//! assert_eq!(definition, "lasting a very short time");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Sharded rate limiter and circuit breakers |
//! | [`cache`] | L1 memory + L2 compressed cache with single-flight loads |
//! | [`recovery`] | Error classification, retry policy, fallbacks |
//! | [`persistence`] | Load/save boundary for breaker and shard state |
//! | [`events`] | Observability boundary (`EventSink`) |
//! | [`config`] | File-level configuration |

pub mod cache;
pub mod config;
pub mod events;
pub mod gate;
pub mod persistence;
pub mod recovery;
pub mod resilience;

// Re-export main types for convenience
pub use cache::{CacheConfig, MultiTierCache};
pub use config::ResilienceConfig;
pub use events::{EventSink, ResilienceEvent};
pub use gate::{GateRequest, ResilienceGate, ResilienceGateBuilder};
pub use persistence::StateStore;
pub use recovery::{ErrorCategory, ErrorRecoveryManager, RecoveryContext, RetryPolicy};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    RateLimiterConfig, ShardedRateLimiter,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

/// Wall-clock milliseconds since the unix epoch; used for cache expiry and persisted state.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
