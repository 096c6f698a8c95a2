//! L2 storage backends.
//!
//! Backends store already-compressed payloads together with their metadata; expiry,
//! quota enforcement and compression are decided by the cache manager.

use super::compression::Compression;
use super::key::sha256_hex;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const FRAME_MAGIC: &[u8; 4] = b"ALRC";
const ENTRY_EXT: &str = "entry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub compression: Compression,
    /// Decoded payload size.
    pub original_size: usize,
    /// Stored (compressed) payload size.
    pub size_bytes: usize,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub hit_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EntryMeta {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    /// Compressed with `meta.compression`.
    pub payload: Bytes,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Entry for `key` regardless of expiry; counts a hit.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: CacheEntry) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Remove every entry carrying `tag`; returns the removed keys.
    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>>;
    /// Metadata of every stored entry.
    async fn entries(&self) -> Result<Vec<EntryMeta>>;
    /// Sum of stored payload sizes.
    async fn total_bytes(&self) -> Result<u64>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// Non-persistent L2, mainly for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut entries = self.lock();
        Ok(entries.get_mut(key).map(|e| {
            e.meta.hit_count += 1;
            e.clone()
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.lock().insert(entry.meta.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut entries = self.lock();
        let keys: Vec<String> = entries
            .values()
            .filter(|e| e.meta.tags.iter().any(|t| t == tag))
            .map(|e| e.meta.key.clone())
            .collect();
        for k in &keys {
            entries.remove(k);
        }
        Ok(keys)
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>> {
        Ok(self.lock().values().map(|e| e.meta.clone()).collect())
    }

    async fn total_bytes(&self) -> Result<u64> {
        Ok(self.lock().values().map(|e| e.meta.size_bytes as u64).sum())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Directory of framed entry files, one per key.
///
/// Frame layout: `ALRC` magic, big-endian `u32` header length, JSON [`EntryMeta`], payload.
/// File names are the SHA-256 of the key. The metadata index is rebuilt by scanning the
/// directory on open, so entries survive restarts.
pub struct FileBackend {
    dir: PathBuf,
    index: Mutex<HashMap<String, EntryMeta>>,
}

impl FileBackend {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::storage_with_context(
                format!("cannot create cache directory: {}", e),
                ErrorContext::new()
                    .with_details(dir.display().to_string())
                    .with_source("file_backend"),
            )
        })?;
        let mut index = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            match tokio::fs::read(&path).await.map_err(Error::from).and_then(|b| decode_frame(&b)) {
                Ok((meta, _)) => {
                    index.insert(meta.key.clone(), meta);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "dropping unreadable cache entry");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        tracing::debug!(dir = %dir.display(), entries = index.len(), "opened file cache backend");
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sha256_hex(key.as_bytes()), ENTRY_EXT))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EntryMeta>> {
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn remove_file(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode_frame(meta: &EntryMeta, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(meta)?;
    let mut out = Vec::with_capacity(8 + header.len() + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode_frame(data: &[u8]) -> Result<(EntryMeta, Bytes)> {
    let corrupt = |what: &str| {
        Error::storage_with_context(
            format!("corrupt cache entry: {}", what),
            ErrorContext::new().with_source("file_backend"),
        )
    };
    if data.len() < 8 || &data[..4] != FRAME_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&data[4..8]);
    let header_len = u32::from_be_bytes(len) as usize;
    let body = &data[8..];
    if body.len() < header_len {
        return Err(corrupt("truncated header"));
    }
    let meta: EntryMeta = serde_json::from_slice(&body[..header_len])?;
    let payload = Bytes::copy_from_slice(&body[header_len..]);
    if payload.len() != meta.size_bytes {
        return Err(corrupt("payload size mismatch"));
    }
    Ok((meta, payload))
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if !self.lock().contains_key(key) {
            return Ok(None);
        }
        let data = match tokio::fs::read(self.path_for(key)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.lock().remove(key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let (mut meta, payload) = decode_frame(&data)?;
        {
            let mut index = self.lock();
            match index.get_mut(key) {
                Some(m) => {
                    m.hit_count += 1;
                    meta.hit_count = m.hit_count;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(CacheEntry { meta, payload }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let path = self.path_for(&entry.meta.key);
        // one temp file per writer; concurrent puts of a key must not share it
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let frame = encode_frame(&entry.meta, &entry.payload)?;
        let written = match tokio::fs::write(&tmp, frame).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.lock().insert(entry.meta.key.clone(), entry.meta);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.lock().remove(key).is_some();
        if existed {
            self.remove_file(key).await?;
        }
        Ok(existed)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = {
            let mut index = self.lock();
            let keys: Vec<String> = index
                .values()
                .filter(|m| m.tags.iter().any(|t| t == tag))
                .map(|m| m.key.clone())
                .collect();
            for k in &keys {
                index.remove(k);
            }
            keys
        };
        for k in &keys {
            self.remove_file(k).await?;
        }
        Ok(keys)
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn total_bytes(&self) -> Result<u64> {
        Ok(self.lock().values().map(|m| m.size_bytes as u64).sum())
    }

    async fn clear(&self) -> Result<()> {
        let keys: Vec<String> = self.lock().drain().map(|(k, _)| k).collect();
        for k in &keys {
            self.remove_file(k).await?;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
