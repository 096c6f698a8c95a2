//! Consistent-hash ring mapping keys to shard ids.
//!
//! Each shard owns a number of virtual nodes on a 64-bit ring; a key goes to the first
//! node at or after its hash. Rebalancing builds a new ring with fewer nodes for hot
//! shards and more for cold ones, so only a fraction of keys move.

use sha2::{Digest, Sha256};

pub(crate) const DEFAULT_VNODES: usize = 64;

const MIN_WEIGHT: f64 = 0.25;
const MAX_WEIGHT: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u64, usize)>,
    shard_count: usize,
    version: u64,
}

/// First eight bytes of the SHA-256 digest, big-endian. Stable across builds, so persisted
/// shard snapshots keep their keys after an upgrade.
pub(crate) fn hash_key(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl HashRing {
    pub fn uniform(shard_count: usize, vnodes: usize) -> Self {
        Self::weighted(&vec![1.0; shard_count], vnodes, 0)
    }

    /// Build a ring where shard `i` owns roughly `vnodes * weights[i]` nodes (at least one).
    pub fn weighted(weights: &[f64], vnodes: usize, version: u64) -> Self {
        let mut points = Vec::new();
        for (shard, weight) in weights.iter().enumerate() {
            let count = ((vnodes as f64) * weight).round().max(1.0) as usize;
            for replica in 0..count {
                points.push((hash_key(&format!("shard-{}#{}", shard, replica)), shard));
            }
        }
        points.sort_unstable();
        Self {
            points,
            shard_count: weights.len(),
            version,
        }
    }

    /// Ring weighted away from busy shards. `utilization` holds one value in `[0, 1]` per shard.
    pub fn rebalanced(utilization: &[f64], vnodes: usize, version: u64) -> Self {
        let inverse: Vec<f64> = utilization.iter().map(|u| 1.0 / (0.1 + u.clamp(0.0, 1.0))).collect();
        let mean = inverse.iter().sum::<f64>() / inverse.len().max(1) as f64;
        let weights: Vec<f64> = inverse
            .iter()
            .map(|w| (w / mean).clamp(MIN_WEIGHT, MAX_WEIGHT))
            .collect();
        Self::weighted(&weights, vnodes, version)
    }

    pub fn route(&self, key: &str) -> usize {
        if self.shard_count <= 1 || self.points.is_empty() {
            return 0;
        }
        let h = hash_key(key);
        let idx = self.points.partition_point(|(p, _)| *p < h);
        self.points[idx % self.points.len()].1
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Virtual nodes held by each shard.
    pub fn node_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.shard_count];
        for (_, shard) in &self.points {
            counts[*shard] += 1;
        }
        counts
    }
}
