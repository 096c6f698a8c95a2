use std::sync::Arc;
use thiserror::Error;

/// Structured error context attached to configuration, storage and transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Config key or field that caused the error (e.g., "rate_limiter.capacity").
    pub field_path: Option<String>,
    /// Additional details (expected value, offending path, ...).
    pub details: Option<String>,
    /// Component that raised the error (e.g., "file_backend", "state_store").
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the resilience layer.
///
/// Admission refusals (`NoCapacity`, `Throttled`, `CircuitOpen`) are reported, never
/// retried, by the component that produced them. Upstream failures are expressed with
/// `Remote`, `Transport` and `Timeout` so that the recovery manager can classify them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No capacity: cost {cost} exceeds shard capacity {capacity}")]
    NoCapacity { cost: u32, capacity: f64 },

    #[error("Throttled: retry after {retry_after_ms} ms")]
    Throttled { retry_after_ms: u64 },

    #[error("Circuit open for service '{service}' (retry after {retry_after_ms} ms)")]
    CircuitOpen { service: String, retry_after_ms: u64 },

    #[error("Cache load failed for key '{key}': {source}")]
    CacheLoad {
        key: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("Remote error: HTTP {status} ({class}): {message}")]
    Remote {
        status: u16,
        class: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Transport error: {message}{}", format_context(.context))]
    Transport {
        message: String,
        context: ErrorContext,
    },

    #[error("Operation '{operation}' timed out after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Storage error: {message}{}", format_context(.context))]
    Storage {
        message: String,
        context: ErrorContext,
    },

    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("Business rule '{rule}' violated: {message}")]
    Business { rule: String, message: String },

    #[error("Service '{service}' degraded: {message}")]
    Degraded { service: String, message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Compression error ({codec}): {message}")]
    Compression { codec: String, message: String },

    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn storage_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Storage {
            message: msg.into(),
            context,
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// Upstream HTTP failure; the class is derived from the status code.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Error::Remote {
            status,
            class: crate::recovery::status_class(status).to_string(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn business(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Business {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Attach a provider retry hint to a `Remote` error; other variants are returned as-is.
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        if let Error::Remote {
            ref mut retry_after_ms,
            ..
        } = self
        {
            *retry_after_ms = Some(ms);
        }
        self
    }

    /// HTTP status carried by the error, looking through cache-load wrappers.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Remote { status, .. } => Some(*status),
            Error::CacheLoad { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Delay hint carried by the error, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::Remote { retry_after_ms, .. } => *retry_after_ms,
            Error::Throttled { retry_after_ms } => Some(*retry_after_ms),
            Error::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            Error::CacheLoad { source, .. } => source.retry_after_ms(),
            _ => None,
        }
    }

    /// Stable variant name, used in error fingerprints and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoCapacity { .. } => "no_capacity",
            Error::Throttled { .. } => "throttled",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::CacheLoad { .. } => "cache_load",
            Error::Remote { .. } => "remote",
            Error::Transport { .. } => "transport",
            Error::Timeout { .. } => "timeout",
            Error::Storage { .. } => "storage",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::Business { .. } => "business",
            Error::Degraded { .. } => "degraded",
            Error::Configuration { .. } => "configuration",
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Compression { .. } => "compression",
            Error::Cancelled { .. } => "cancelled",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Yaml(_) => "yaml",
        }
    }

    /// Extract error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Storage { context, .. }
            | Error::Transport { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "capacity must be positive",
            ErrorContext::new()
                .with_field_path("rate_limiter.capacity")
                .with_source("config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: capacity must be positive (field: rate_limiter.capacity, source: config)"
        );
    }

    #[test]
    fn test_status_looks_through_cache_load() {
        let inner = Error::remote(503, "overloaded").with_retry_after_ms(250);
        let err = Error::CacheLoad {
            key: "k".into(),
            source: Arc::new(inner),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.retry_after_ms(), Some(250));
        assert_eq!(err.kind(), "cache_load");
    }

    #[test]
    fn test_remote_class_from_status() {
        match Error::remote(429, "slow down") {
            Error::Remote { class, .. } => assert_eq!(class, "rate_limited"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
