use super::classify::{classify, ErrorCategory, ErrorSeverity, RecoveryStrategy};
use crate::cache::sha256_hex;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Analytics record emitted for every recovery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Stable across occurrences of the same failure; use it to de-duplicate.
    pub fingerprint: String,
    pub message: String,
    pub status: Option<u16>,
    pub context: BTreeMap<String, String>,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
    pub recovered: bool,
    /// Re-invocations made while recovering.
    pub attempts: u32,
    pub timestamp: f64,
}

impl ErrorRecord {
    pub fn from_error(
        error: &Error,
        strategy: RecoveryStrategy,
        context: BTreeMap<String, String>,
    ) -> Self {
        let category = classify(error);
        let message = error.to_string();
        Self {
            id: Uuid::new_v4(),
            kind: error.kind().to_string(),
            category,
            severity: category.default_severity(),
            fingerprint: fingerprint(error.kind(), category, &message),
            message,
            status: error.status(),
            context,
            recoverable: category.is_recoverable() && strategy != RecoveryStrategy::Fail,
            strategy,
            recovered: false,
            attempts: 0,
            timestamp: crate::events::timestamp(),
        }
    }
}

/// First 16 bytes of `sha256(kind:category:message[..100])`, hex encoded.
pub fn fingerprint(kind: &str, category: ErrorCategory, message: &str) -> String {
    let prefix: String = message.chars().take(100).collect();
    let mut hex = sha256_hex(format!("{}:{}:{}", kind, category, prefix).as_bytes());
    hex.truncate(32);
    hex
}
