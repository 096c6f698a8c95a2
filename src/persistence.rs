//! Restart continuity for breaker and shard state.
//!
//! Components only see the [`StateStore`] load/save pair; the backing store is chosen by
//! the application. Two implementations ship with the crate: [`MemoryStateStore`] for
//! tests and single-process use, and [`JsonFileStateStore`] which writes one JSON
//! document per id into a directory.

use crate::resilience::circuit_breaker::CircuitBreakerState;
use crate::resilience::shard::ShardSnapshot;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Persisted record, tagged so one store can hold both kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredState {
    CircuitBreaker(CircuitBreakerState),
    Shard(ShardSnapshot),
}

pub trait StateStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<StoredState>>;
    fn save(&self, id: &str, state: &StoredState) -> Result<()>;
}

/// Store id for a breaker.
pub fn circuit_state_id(service: &str) -> String {
    format!("circuit:{}", service)
}

/// Store id for a limiter shard.
pub fn shard_state_id(limiter: &str, shard_id: usize) -> String {
    format!("shard:{}:{}", limiter, shard_id)
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, StoredState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, id: &str) -> Result<Option<StoredState>> {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        Ok(states.get(id).cloned())
    }

    fn save(&self, id: &str, state: &StoredState) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.insert(id.to_string(), state.clone());
        Ok(())
    }
}

/// One JSON file per id. Writes go to a temp file first and are renamed into place.
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::storage_with_context(
                format!("cannot create state directory: {}", e),
                ErrorContext::new()
                    .with_details(dir.display().to_string())
                    .with_source("json_file_state_store"),
            )
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let readable: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let digest = Sha256::digest(id.as_bytes());
        let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}-{}.json", readable, suffix))
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self, id: &str) -> Result<Option<StoredState>> {
        let path = self.path_for(id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &str, state: &StoredState) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let written = std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)
            .and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: usize) -> StoredState {
        StoredState::Shard(ShardSnapshot {
            shard_id: id,
            capacity: 10.0,
            refill_per_second: 5.0,
            tokens: 4.5,
            pending_reservations: 0,
            saved_at_ms: 1,
        })
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.load("shard:a:0").unwrap().is_none());
        store.save("shard:a:0", &snapshot(0)).unwrap();
        assert_eq!(store.load("shard:a:0").unwrap(), Some(snapshot(0)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStateStore::open(dir.path()).unwrap();
            store.save(&shard_state_id("api", 2), &snapshot(2)).unwrap();
        }
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        assert_eq!(
            store.load(&shard_state_id("api", 2)).unwrap(),
            Some(snapshot(2))
        );
        assert!(store.load(&shard_state_id("api", 3)).unwrap().is_none());
    }

    #[test]
    fn test_ids_do_not_collide_after_sanitizing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        assert_ne!(store.path_for("circuit:a/b"), store.path_for("circuit:a_b"));
    }
}
