//! File-level configuration grouping every component's settings.
//!
//! ```yaml
//! rate_limiter:
//!   capacity: 600
//!   refill_per_second: 10
//!   adaptive: true
//! circuit_breaker:
//!   default:
//!     failure_threshold: 5
//!     recovery_timeout_ms: 30000
//!   services:
//!     embeddings:
//!       failure_threshold: 3
//! cache:
//!   max_entries: 5000
//!   compression: gzip
//! retry:
//!   max_attempts: 4
//! state_dir: /var/lib/resilience
//! ```

use crate::cache::CacheConfig;
use crate::error::ErrorContext;
use crate::recovery::RetryPolicy;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming a config file for [`ResilienceConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "AI_RESILIENCE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub default: CircuitBreakerConfig,
    /// Per-service overrides of `default`.
    pub services: BTreeMap<String, CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: BreakerSettings,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    /// Directory for persisted breaker and shard state; in-memory when unset.
    pub state_dir: Option<PathBuf>,
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.json` file as JSON and anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new().with_details(path.display().to_string()),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Load the file named by `AI_RESILIENCE_CONFIG`, or defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker.default = config;
        self
    }

    pub fn with_service_breaker(
        mut self,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.circuit_breaker.services.insert(service.into(), config);
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()?;
        self.circuit_breaker.default.validate()?;
        for (service, config) in &self.circuit_breaker.services {
            config.validate().map_err(|e| match e {
                Error::Configuration { message, context } => Error::configuration_with_context(
                    message,
                    context.with_details(format!("service '{}'", service)),
                ),
                other => other,
            })?;
        }
        self.cache.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Compression;

    #[test]
    fn test_yaml_partial_config_uses_defaults() {
        let config = ResilienceConfig::from_yaml_str(
            r#"
rate_limiter:
  capacity: 600
  refill_per_second: 10
circuit_breaker:
  services:
    embeddings:
      failure_threshold: 3
cache:
  compression: gzip
"#,
        )
        .unwrap();
        assert_eq!(config.rate_limiter.capacity, 600.0);
        assert_eq!(config.rate_limiter.reservation_ttl_ms, 60_000);
        assert_eq!(config.circuit_breaker.default.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.services["embeddings"].failure_threshold, 3);
        assert_eq!(config.cache.compression, Compression::Gzip);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ResilienceConfig::from_yaml_str("rate_limiter:\n  capacity: 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        let err = ResilienceConfig::from_yaml_str(
            "circuit_breaker:\n  services:\n    llm:\n      failure_threshold: 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("service 'llm'"));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("resilience.json");
        std::fs::write(&json, r#"{"retry": {"max_attempts": 7}}"#).unwrap();
        assert_eq!(ResilienceConfig::from_file(&json).unwrap().retry.max_attempts, 7);

        let yaml = dir.path().join("resilience.yaml");
        std::fs::write(&yaml, "cache:\n  max_entries: 10\n").unwrap();
        assert_eq!(ResilienceConfig::from_file(&yaml).unwrap().cache.max_entries, 10);

        assert!(ResilienceConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
