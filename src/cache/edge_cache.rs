//! Edge-block cache: the device DRAM region holding edge blocks.
//!
//! The cache tracks how many bytes of each edge block are resident. It never
//! stores edge data itself; the simulation only needs residency to decide how
//! much of a block still has to be fetched from flash.
//!
//! - Entries live in admission order; re-accessed entries move to the tail.
//! - Eviction follows the configured [`EvictionPolicy`].
//! - Partial eviction shrinks the last victim by exactly the shortfall.
//! - Speculative accesses under the priority policy refuse to evict entries
//!   that rank above the one being admitted.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::entry::{AccessIntent, AdmissionTag, BlockKey, CacheEntry};
use crate::cache::evictor::{is_lower_priority, EvictionPolicy, Evictor, RowReadiness};
use crate::config::EdgeCacheConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cannot allocate a new cache entry record (limit {limit:?})")]
    AllocationFailed { limit: Option<usize> },
}

/// Page-granularity access counters. Only demand accesses are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    pub hit_pages: u64,
    pub miss_pages: u64,
    pub total_pages: u64,
}

impl AccessStats {
    /// Hit fraction of all demand pages (0.0 when nothing was accessed).
    pub fn hit_ratio(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        self.hit_pages as f64 / self.total_pages as f64
    }

    pub(crate) fn record(&mut self, requested_pages: u64, resident_pages: u64) {
        let hit = resident_pages.min(requested_pages);
        self.hit_pages += hit;
        self.miss_pages += requested_pages - hit;
        self.total_pages += requested_pages;
    }
}

#[derive(Debug, Default)]
struct BlockCacheState {
    /// Resident entries in admission order (ascending `seq`).
    entries: VecDeque<CacheEntry>,

    /// Key to admission sequence of the resident entry.
    index: HashMap<BlockKey, u64>,

    /// Resident bytes.
    size: u64,

    next_seq: u64,

    stats: AccessStats,
}

impl BlockCacheState {
    fn position(&self, key: &BlockKey) -> Option<usize> {
        let seq = *self.index.get(key)?;
        self.entries.binary_search_by_key(&seq, |e| e.seq).ok()
    }

    fn push(&mut self, key: BlockKey, size: u64, tag: AdmissionTag) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(CacheEntry { key, size, tag, seq });
        self.index.insert(key, seq);
        self.size += size;
    }

    /// Unlinks an entry. The caller decides whether its bytes stay accounted.
    fn unlink(&mut self, pos: usize) -> Option<CacheEntry> {
        let entry = self.entries.remove(pos)?;
        self.index.remove(&entry.key);
        Some(entry)
    }

    fn remove(&mut self, pos: usize) -> Option<CacheEntry> {
        let entry = self.unlink(pos)?;
        self.size -= entry.size;
        Some(entry)
    }
}

/// Capacity-bounded edge-block residency cache.
pub struct BlockCache {
    state: Mutex<BlockCacheState>,
    evictor: Evictor,
    capacity: u64,
    partial_eviction: bool,
    page_size: u64,
    max_entries: Option<usize>,
}

impl BlockCache {
    /// Create an empty cache.
    pub fn new(config: &EdgeCacheConfig, page_size: u64) -> Self {
        info!(
            capacity = config.capacity_bytes,
            policy = %config.policy,
            partial_eviction = config.partial_eviction,
            invalidate_at_future_value = config.invalidate_at_future_value,
            "Edge cache initialized"
        );

        Self {
            state: Mutex::new(BlockCacheState::default()),
            evictor: Evictor::new(config.policy),
            capacity: config.capacity_bytes,
            partial_eviction: config.partial_eviction,
            page_size: page_size.max(1),
            max_entries: config.max_entries,
        }
    }

    /// Access `requested` bytes of an edge block, making it resident.
    ///
    /// Returns the number of bytes that were not resident and must be fetched.
    /// A miss admits `min(requested, capacity)` bytes (or only the room a
    /// speculative access managed to free). A hit on a partially resident
    /// entry tops it up when partial eviction is enabled and otherwise leaves
    /// it at its current size.
    pub fn access(
        &self,
        key: BlockKey,
        requested: u64,
        intent: AccessIntent,
        readiness: &dyn RowReadiness,
    ) -> Result<u64, CacheError> {
        if requested == 0 {
            return Ok(0);
        }

        let speculative = intent.is_speculative();
        let target = requested.min(self.capacity);
        let mut state = self.state.lock();

        match state.position(&key) {
            None => {
                let tag = intent.admission_tag();
                self.reserve_slot(&mut state, key, tag, speculative, readiness)?;
                let free = self.make_room(&mut state, key, target, tag, speculative, readiness);
                let size = target.min(free);
                if !speculative {
                    state.stats.record(requested / self.page_size, 0);
                }
                if size > 0 {
                    state.push(key, size, tag);
                }
                debug!(%key, requested, admitted = size, ?intent, "Edge cache miss");
                Ok(requested)
            }
            Some(pos) => {
                // Unlink but keep its bytes accounted, so it cannot be its own victim.
                let entry = match state.unlink(pos) {
                    Some(entry) => entry,
                    None => return Ok(requested),
                };
                let current = entry.size;
                let tag = if speculative {
                    entry.tag
                } else {
                    intent.admission_tag()
                };

                let mut size = current;
                if self.partial_eviction && target > current {
                    let need = target - current;
                    let free = self.make_room(&mut state, key, need, tag, speculative, readiness);
                    size = current + need.min(free);
                }

                state.size -= current;
                state.push(key, size, tag);
                if !speculative {
                    state
                        .stats
                        .record(requested / self.page_size, current / self.page_size);
                }
                debug!(%key, requested, resident = current, now = size, ?intent, "Edge cache hit");
                Ok(requested.saturating_sub(current))
            }
        }
    }

    /// Evict until `need` more bytes fit or eviction has to stop.
    ///
    /// Returns the free room left afterwards.
    fn make_room(
        &self,
        state: &mut BlockCacheState,
        key: BlockKey,
        need: u64,
        tag: AdmissionTag,
        speculative: bool,
        readiness: &dyn RowReadiness,
    ) -> u64 {
        let incoming = CacheEntry {
            key,
            size: need,
            tag,
            seq: state.next_seq,
        };

        while !state.entries.is_empty() && state.size + need > self.capacity {
            let pos = match self.evictor.select_victim(&state.entries, readiness) {
                Some(pos) => pos,
                None => break,
            };
            let victim = state.entries[pos];

            if speculative
                && self.evictor.policy() == EvictionPolicy::Priority
                && is_lower_priority(&incoming, &victim, readiness)
            {
                debug!(%key, victim = %victim.key, "Speculative admission refused to evict");
                break;
            }

            if self.partial_eviction && state.size - victim.size + need < self.capacity {
                let shortfall = state.size + need - self.capacity;
                state.entries[pos].size -= shortfall;
                state.size -= shortfall;
                debug!(victim = %victim.key, shrunk_by = shortfall, "Partially evicted edge block");
                break;
            }

            state.remove(pos);
            debug!(victim = %victim.key, size = victim.size, "Evicted edge block");
        }

        self.capacity.saturating_sub(state.size)
    }

    /// Make sure one more entry record can be stored.
    ///
    /// At the entry limit the policy's victim is evicted whole. Fails when the
    /// cache is empty or a speculative admission refuses the victim.
    fn reserve_slot(
        &self,
        state: &mut BlockCacheState,
        key: BlockKey,
        tag: AdmissionTag,
        speculative: bool,
        readiness: &dyn RowReadiness,
    ) -> Result<(), CacheError> {
        if let Some(limit) = self.max_entries {
            let failed = CacheError::AllocationFailed { limit: Some(limit) };
            let incoming = CacheEntry {
                key,
                size: 0,
                tag,
                seq: state.next_seq,
            };

            while state.entries.len() >= limit {
                let Some(pos) = self.evictor.select_victim(&state.entries, readiness) else {
                    return Err(failed);
                };
                let victim = state.entries[pos];
                if speculative
                    && self.evictor.policy() == EvictionPolicy::Priority
                    && is_lower_priority(&incoming, &victim, readiness)
                {
                    debug!(%key, victim = %victim.key, "Speculative admission refused at entry limit");
                    return Err(failed);
                }
                state.remove(pos);
                debug!(victim = %victim.key, size = victim.size, limit, "Evicted edge block at entry limit");
            }
        }
        state
            .entries
            .try_reserve(1)
            .map_err(|_| CacheError::AllocationFailed {
                limit: self.max_entries,
            })
    }

    /// Remove one edge block if resident. Returns the bytes released.
    pub fn invalidate(&self, key: BlockKey) -> Option<u64> {
        let mut state = self.state.lock();
        let pos = state.position(&key)?;
        let entry = state.remove(pos)?;
        debug!(%key, size = entry.size, "Invalidated edge block");
        Some(entry.size)
    }

    /// Remove the oldest admitted entry.
    pub fn invalidate_oldest(&self) -> Option<BlockKey> {
        let mut state = self.state.lock();
        let entry = state.remove(0)?;
        Some(entry.key)
    }

    /// Move up to `bytes` of already-counted misses to hits.
    ///
    /// Used when a block's fetch was hidden behind the compute of the same task.
    pub fn credit_overlap(&self, bytes: u64) {
        let mut state = self.state.lock();
        let pages = (bytes / self.page_size).min(state.stats.miss_pages);
        state.stats.miss_pages -= pages;
        state.stats.hit_pages += pages;
    }

    /// Resident bytes of one edge block.
    pub fn resident_size(&self, key: BlockKey) -> Option<u64> {
        let state = self.state.lock();
        let pos = state.position(&key)?;
        Some(state.entries[pos].size)
    }

    /// Total resident bytes.
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

    pub fn policy(&self) -> EvictionPolicy {
        self.evictor.policy()
    }

    pub fn stats(&self) -> AccessStats {
        self.state.lock().stats
    }

    /// Resident entries in admission order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.state.lock().entries.iter().copied().collect()
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        *self.state.lock() = BlockCacheState::default();
    }
}
