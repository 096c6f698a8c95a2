//! Cache key derivation.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Builds deterministic keys from a namespace and named parts.
///
/// Parts are canonicalised (sorted by name) before hashing, so insertion order does not matter.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    namespace: String,
    parts: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            parts: BTreeMap::new(),
        }
    }

    pub fn part(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.insert(name.into(), value.into());
        self
    }

    /// Add a part from any serializable value (its JSON form is hashed).
    pub fn json_part<T: Serialize>(self, name: impl Into<String>, value: &T) -> Self {
        let encoded = serde_json::to_string(value).unwrap_or_default();
        self.part(name, encoded)
    }

    /// `namespace:sha256hex`
    pub fn build(&self) -> String {
        let canonical = serde_json::to_string(&self.parts).unwrap_or_default();
        format!("{}:{}", self.namespace, sha256_hex(canonical.as_bytes()))
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_order_irrelevant() {
        let a = CacheKeyBuilder::new("stage1").part("term", "ephemeral").part("lang", "en");
        let b = CacheKeyBuilder::new("stage1").part("lang", "en").part("term", "ephemeral");
        assert_eq!(a.build(), b.build());
        assert!(a.build().starts_with("stage1:"));
    }

    #[test]
    fn test_parts_change_key() {
        let a = CacheKeyBuilder::new("stage2").json_part("temperature", &0.2);
        let b = CacheKeyBuilder::new("stage2").json_part("temperature", &0.7);
        assert_ne!(a.build(), b.build());
    }
}
