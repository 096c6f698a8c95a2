//! Error classification: category, severity and default strategy.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure; retrying may succeed.
    Transient,
    /// Retrying cannot succeed (bad input, missing resource, auth).
    Permanent,
    /// Infrastructure trouble on our side or a tripped breaker.
    System,
    /// A domain rule was violated.
    Business,
    /// The dependency answered, but in a degraded mode.
    Degraded,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::System => "system",
            ErrorCategory::Business => "business",
            ErrorCategory::Degraded => "degraded",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Transient => ErrorSeverity::Medium,
            ErrorCategory::Permanent => ErrorSeverity::High,
            ErrorCategory::System => ErrorSeverity::Critical,
            ErrorCategory::Business => ErrorSeverity::Medium,
            ErrorCategory::Degraded => ErrorSeverity::Low,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-invoke the operation with exponential backoff.
    Retry,
    /// Surface the error immediately.
    Fail,
    /// Re-invoke through the service's circuit breaker, falling back when it is open.
    CircuitBreak,
    /// Serve stale cache data, a fallback function or a fallback value.
    Fallback,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fail => "fail",
            RecoveryStrategy::CircuitBreak => "circuit_break",
            RecoveryStrategy::Fallback => "fallback",
        }
    }
}

/// Default strategy for each category.
pub fn strategy_for(category: ErrorCategory) -> RecoveryStrategy {
    match category {
        ErrorCategory::Transient => RecoveryStrategy::Retry,
        ErrorCategory::Permanent => RecoveryStrategy::Fail,
        ErrorCategory::System => RecoveryStrategy::CircuitBreak,
        ErrorCategory::Business | ErrorCategory::Degraded => RecoveryStrategy::Fallback,
    }
}

/// Class name for an HTTP status, matching the standard error code names.
pub fn status_class(status: u16) -> &'static str {
    match status {
        400 => "invalid_request",
        401 => "authentication",
        403 => "permission_denied",
        404 => "not_found",
        408 => "timeout",
        409 => "conflict",
        413 => "request_too_large",
        429 => "rate_limited",
        500 => "server_error",
        502 => "bad_gateway",
        503 => "overloaded",
        504 => "timeout",
        s if (400..500).contains(&s) => "invalid_request",
        s if (500..600).contains(&s) => "server_error",
        _ => "unknown",
    }
}

/// HTTP statuses that describe a temporary condition.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Category for an error. Cache-load failures are classified by their cause.
pub fn classify(error: &Error) -> ErrorCategory {
    match error {
        Error::Remote { status, .. } if is_transient_status(*status) => ErrorCategory::Transient,
        Error::Remote { .. } => ErrorCategory::Permanent,
        Error::Transport { .. } | Error::Timeout { .. } | Error::Throttled { .. } => {
            ErrorCategory::Transient
        }
        Error::Validation { .. }
        | Error::Configuration { .. }
        | Error::NotFound { .. }
        | Error::NoCapacity { .. }
        | Error::Cancelled { .. } => ErrorCategory::Permanent,
        Error::Storage { .. }
        | Error::Io(_)
        | Error::ResourceExhausted { .. }
        | Error::Serialization(_)
        | Error::Yaml(_)
        | Error::Compression { .. }
        | Error::CircuitOpen { .. } => ErrorCategory::System,
        Error::Business { .. } => ErrorCategory::Business,
        Error::Degraded { .. } => ErrorCategory::Degraded,
        Error::CacheLoad { source, .. } => classify(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify(&Error::remote(503, "busy")), ErrorCategory::Transient);
        assert_eq!(classify(&Error::remote(429, "slow")), ErrorCategory::Transient);
        assert_eq!(classify(&Error::remote(408, "slow")), ErrorCategory::Transient);
        assert_eq!(classify(&Error::remote(401, "who")), ErrorCategory::Permanent);
        assert_eq!(classify(&Error::remote(404, "gone")), ErrorCategory::Permanent);
    }

    #[test]
    fn test_variant_classification() {
        assert_eq!(classify(&Error::transport("reset")), ErrorCategory::Transient);
        assert_eq!(
            classify(&Error::Throttled { retry_after_ms: 5 }),
            ErrorCategory::Transient
        );
        assert_eq!(
            classify(&Error::NoCapacity {
                cost: 20,
                capacity: 10.0
            }),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classify(&Error::ResourceExhausted {
                message: "disk".into()
            }),
            ErrorCategory::System
        );
        assert_eq!(
            classify(&Error::business("quota", "daily quota used")),
            ErrorCategory::Business
        );
        let wrapped = Error::CacheLoad {
            key: "k".into(),
            source: Arc::new(Error::remote(502, "bad gateway")),
        };
        assert_eq!(classify(&wrapped), ErrorCategory::Transient);
    }

    #[test]
    fn test_default_strategies() {
        assert_eq!(strategy_for(ErrorCategory::Transient), RecoveryStrategy::Retry);
        assert_eq!(strategy_for(ErrorCategory::Permanent), RecoveryStrategy::Fail);
        assert_eq!(strategy_for(ErrorCategory::System), RecoveryStrategy::CircuitBreak);
        assert_eq!(strategy_for(ErrorCategory::Degraded), RecoveryStrategy::Fallback);
        assert!(!ErrorCategory::Permanent.is_recoverable());
    }

    #[test]
    fn test_status_class_names() {
        assert_eq!(status_class(429), "rate_limited");
        assert_eq!(status_class(503), "overloaded");
        assert_eq!(status_class(418), "invalid_request");
        assert_eq!(status_class(599), "server_error");
        assert_eq!(status_class(302), "unknown");
    }
}
