//! 错误恢复模块：分类、策略选择（重试 / 熔断 / 降级）与错误记录。
//!
//! # Error Recovery
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`classify`] | Maps an [`Error`](crate::Error) to an [`ErrorCategory`] |
//! | [`RetryPolicy`] | Exponential backoff with jitter and a retryable-status allowlist |
//! | [`ErrorRecoveryManager`] | Executes the strategy selected for the category |
//! | [`ErrorRecord`] | Analytics record emitted for every outcome |
//!
//! Default strategies:
//!
//! | Category | Strategy |
//! |----------|----------|
//! | Transient | Retry |
//! | Permanent | Fail |
//! | System | CircuitBreak |
//! | Business, Degraded | Fallback |
//!
//! ```rust
//! use ai_lib_resilience::recovery::{ErrorRecoveryManager, RecoveryContext, RetryPolicy};
//! use ai_lib_resilience::Error;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = ErrorRecoveryManager::new(RetryPolicy::none());
//! let value = manager
//!     .recover(
//!         Error::business("daily_quota", "quota used up"),
//!         || async { Ok::<_, Error>(0u32) },
//!         RecoveryContext::new().with_fallback_value(42u32),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```

mod classify;
mod manager;
mod policy;
mod record;

pub use classify::{
    classify, is_transient_status, status_class, strategy_for, ErrorCategory, ErrorSeverity,
    RecoveryStrategy,
};
pub use manager::{ErrorRecoveryManager, RecoveryContext};
pub use policy::RetryPolicy;
pub use record::{fingerprint, ErrorRecord};
