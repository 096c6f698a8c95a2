//! 多级缓存模块：内存 L1 + 压缩持久化 L2，支持单飞加载、标签失效与预热。
//!
//! # Multi-Tier Result Cache
//!
//! Results of costly upstream calls are cached in two tiers:
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MultiTierCache`] | Cache-aside `get` with single-flight loading, tags, warming, stats |
//! | [`CacheConfig`] | Size bounds, eviction policy, codec, TTL and L2 location |
//! | [`CacheBackend`] | Trait for L2 stores |
//! | [`MemoryBackend`] | Non-persistent L2 |
//! | [`FileBackend`] | Directory of framed, compressed entry files |
//! | [`Compression`] | L2 codecs: none, LZ4, gzip, zlib |
//! | [`CacheKeyBuilder`] | Deterministic keys from named parts |
//!
//! L1 holds decoded values and evicts by LRU or LFU when `max_entries` or `max_memory_mb`
//! is exceeded. L2 holds compressed entries and evicts (expired first, then least hit, then
//! oldest) when its stored bytes exceed `l2_quota_mb`. Expiry is checked on every read.
//!
//! ## Example
//!
//! ```rust
//! use ai_lib_resilience::cache::{CacheConfig, MultiTierCache};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_lib_resilience::Result<()> {
//! let cache = MultiTierCache::in_memory(CacheConfig::new().with_max_entries(1_000))?;
//! let answer: String = cache
//!     .get("definition:ephemeral", || async { Ok("lasting a short time".to_string()) },
//!          Duration::from_secs(3600))
//!     .await?;
//! assert_eq!(answer, "lasting a short time");
//! # Ok(())
//! # }
//! ```

mod backend;
mod compression;
mod flight;
mod key;
mod manager;
mod memory;

pub use backend::{CacheBackend, CacheEntry, EntryMeta, FileBackend, MemoryBackend};
pub use compression::Compression;
pub use key::CacheKeyBuilder;
pub(crate) use key::sha256_hex;
pub use manager::{CacheConfig, CacheStats, MultiTierCache, MultiTierCacheBuilder, WarmReport};
pub use memory::EvictionPolicy;
