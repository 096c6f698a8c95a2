//! 弹性模块：分片限流器与按服务熔断器。
//!
//! # Admission Control and Fault Isolation
//!
//! Neither component retries: each reports a refusal (`Admission` with a retry hint,
//! `Error::NoCapacity`, `Error::Throttled`, `Error::CircuitOpen`) and leaves the decision
//! to the caller or to [`crate::recovery::ErrorRecoveryManager`].
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Sharded token-bucket limiter with reservations and adaptive routing |
//! | [`shard`] | One independently locked partition of the limiter's capacity |
//! | [`ring`] | Consistent-hash ring used for key → shard routing |
//! | [`circuit_breaker`] | Closed / Open / HalfOpen breaker with persisted state |
//!
//! A breaker counts only the error categories in `trip_on` (transient and system by default);
//! a 400 or a business-rule refusal says nothing about the upstream's health.
//!
//! ## Rate Limiter
//!
//! ```rust
//! use ai_lib_resilience::resilience::rate_limiter::{RateLimiterConfig, ShardedRateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_lib_resilience::Result<()> {
//! let limiter = ShardedRateLimiter::new(
//!     RateLimiterConfig::new().with_capacity(10.0).with_refill_rate(10.0),
//! )?;
//! let admission = limiter.acquire("user-1", 1);
//! assert!(admission.allowed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use ai_lib_resilience::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_lib_resilience::Result<()> {
//! let registry = CircuitBreakerRegistry::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_recovery_timeout(Duration::from_secs(30)),
//! )?;
//! let answer = registry.call("inference", || async { Ok(42) }).await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod ring;
pub mod shard;

pub use circuit_breaker::{
    AdaptiveThreshold, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitBreakerState, CircuitState,
};
pub use rate_limiter::{
    Admission, AdmissionReason, RateLimiterConfig, RateLimiterStats, Reservation, ReservationId,
    ShardedRateLimiter,
};
pub use shard::{Algorithm, ShardSnapshot, TokenBucketShard};
