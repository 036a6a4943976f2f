//! Vertex-partition cache.
//!
//! Partitions are consumed in arrival order and never re-read out of order, so
//! this cache is FIFO with full eviction only. Evicted bytes are reported back
//! to the caller, which charges the flash write-back for them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::edge_cache::{AccessStats, CacheError};
use crate::cache::entry::{PartitionEntry, PartitionKey};
use crate::config::VertexCacheConfig;

/// Outcome of a partition access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionAccess {
    /// Bytes that were not resident and must be read.
    pub not_resident: u64,

    /// Bytes evicted to make room (to be written back to flash).
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct PartitionCacheState {
    entries: VecDeque<PartitionEntry>,
    size: u64,
    stats: AccessStats,
}

/// FIFO residency cache for vertex partitions.
pub struct PartitionCache {
    state: Mutex<PartitionCacheState>,
    capacity: u64,
    page_size: u64,
    max_entries: Option<usize>,
}

impl PartitionCache {
    pub fn new(config: &VertexCacheConfig, page_size: u64) -> Self {
        info!(capacity = config.capacity_bytes, "Vertex cache initialized");
        Self {
            state: Mutex::new(PartitionCacheState::default()),
            capacity: config.capacity_bytes,
            page_size: page_size.max(1),
            max_entries: config.max_entries,
        }
    }

    /// Access `requested` bytes of a partition version.
    pub fn access(&self, key: PartitionKey, requested: u64) -> Result<PartitionAccess, CacheError> {
        if requested == 0 {
            return Ok(PartitionAccess::default());
        }

        let mut state = self.state.lock();
        let pages = requested / self.page_size;

        let resident = state.entries.iter().find(|e| e.key == key).map(|e| e.size);
        if let Some(current) = resident {
            state.stats.record(pages, current / self.page_size);
            return Ok(PartitionAccess {
                not_resident: requested.saturating_sub(current),
                evicted: 0,
            });
        }

        self.check_slot(&mut state)?;
        let mut evicted = 0;
        if let Some(limit) = self.max_entries {
            while state.entries.len() >= limit {
                let Some(victim) = state.entries.pop_front() else {
                    break;
                };
                state.size -= victim.size;
                evicted += victim.size;
            }
        }

        let size = requested.min(self.capacity);
        evicted += Self::evict_locked(&mut state, size, self.capacity);
        state.entries.push_back(PartitionEntry { key, size });
        state.size += size;
        state.stats.record(pages, 0);
        debug!(partition = key.partition, version = key.version, size, evicted, "Vertex cache miss");

        Ok(PartitionAccess {
            not_resident: requested,
            evicted,
        })
    }

    /// Check that `key` could be admitted without touching the cache.
    ///
    /// Resident keys always pass; a miss at the entry limit passes as long as
    /// there is an oldest partition to evict for it.
    pub fn reserve(&self, key: PartitionKey) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if state.entries.iter().any(|e| e.key == key) {
            return Ok(());
        }
        self.check_slot(&mut state)
    }

    fn check_slot(&self, state: &mut PartitionCacheState) -> Result<(), CacheError> {
        let failed = CacheError::AllocationFailed {
            limit: self.max_entries,
        };
        if self.max_entries == Some(0) {
            return Err(failed);
        }
        state.entries.try_reserve(1).map_err(|_| failed)
    }

    /// Evict oldest partitions until `need` more bytes fit. Returns the bytes evicted.
    pub fn evict(&self, need: u64) -> u64 {
        let mut state = self.state.lock();
        Self::evict_locked(&mut state, need, self.capacity)
    }

    fn evict_locked(state: &mut PartitionCacheState, need: u64, capacity: u64) -> u64 {
        let mut evicted = 0;
        while state.size + need > capacity {
            let Some(victim) = state.entries.pop_front() else {
                break;
            };
            state.size -= victim.size;
            evicted += victim.size;
        }
        evicted
    }

    /// Resident bytes of one partition version.
    pub fn resident_size(&self, key: PartitionKey) -> Option<u64> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.size)
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AccessStats {
        self.state.lock().stats
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        *self.state.lock() = PartitionCacheState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: u64) -> PartitionCache {
        PartitionCache::new(
            &VertexCacheConfig {
                capacity_bytes: capacity,
                max_entries: None,
            },
            4,
        )
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = cache(64);
        let first = cache.access(PartitionKey::new(0, 1), 16).unwrap();
        assert_eq!(first.not_resident, 16);
        let second = cache.access(PartitionKey::new(0, 1), 16).unwrap();
        assert_eq!(second.not_resident, 0);

        let stats = cache.stats();
        assert_eq!(stats.hit_pages, 4);
        assert_eq!(stats.total_pages, 8);
    }

    #[test]
    fn test_versions_are_distinct() {
        let cache = cache(64);
        cache.access(PartitionKey::new(0, 1), 16).unwrap();
        let other = cache.access(PartitionKey::new(0, 2), 16).unwrap();
        assert_eq!(other.not_resident, 16);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fifo_eviction_reports_bytes() {
        let cache = cache(32);
        cache.access(PartitionKey::new(0, 0), 16).unwrap();
        cache.access(PartitionKey::new(1, 0), 16).unwrap();
        let third = cache.access(PartitionKey::new(2, 0), 16).unwrap();
        assert_eq!(third.evicted, 16);
        assert_eq!(cache.resident_size(PartitionKey::new(0, 0)), None);
        assert_eq!(cache.resident_size(PartitionKey::new(1, 0)), Some(16));
        assert!(cache.size() <= cache.capacity());
    }

    #[test]
    fn test_oversized_partition_is_clamped() {
        let cache = cache(32);
        cache.access(PartitionKey::new(0, 0), 16).unwrap();
        let big = cache.access(PartitionKey::new(1, 0), 100).unwrap();
        assert_eq!(big.not_resident, 100);
        assert_eq!(big.evicted, 16);
        assert_eq!(cache.size(), 32);
    }

    fn limited(max_entries: usize) -> PartitionCache {
        PartitionCache::new(
            &VertexCacheConfig {
                capacity_bytes: 64,
                max_entries: Some(max_entries),
            },
            4,
        )
    }

    #[test]
    fn test_entry_limit_evicts_oldest() {
        let cache = limited(1);
        cache.access(PartitionKey::new(0, 0), 8).unwrap();
        assert!(cache.reserve(PartitionKey::new(1, 0)).is_ok());

        let next = cache.access(PartitionKey::new(1, 0), 8).unwrap();
        assert_eq!(next.not_resident, 8);
        assert_eq!(next.evicted, 8);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resident_size(PartitionKey::new(1, 0)), Some(8));
    }

    #[test]
    fn test_zero_entry_limit() {
        let cache = limited(0);
        let key = PartitionKey::new(0, 0);
        assert!(cache.reserve(key).is_err());
        assert!(cache.access(key, 8).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), AccessStats::default());
    }
}
