//! Read-ahead bookkeeping.
//!
//! The scheduler issues at most one read-ahead per processed task. The tracker
//! remembers the last one and, when the next executed task is the block that
//! was read ahead, credits it as a useful prefetch for the admission tier it
//! was issued under. Flush reports the resulting accuracy per tier.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::cache::entry::{AdmissionTag, BlockKey};

/// The most recent read-ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadAhead {
    pub key: BlockKey,
    pub iteration: u32,
    pub tier: AdmissionTag,

    /// Bytes the read-ahead made resident.
    pub bytes: u64,
}

/// Issued and useful read-aheads of one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierAccuracy {
    pub issued_blocks: u64,
    pub hit_blocks: u64,
    pub issued_pages: u64,
    pub hit_pages: u64,
}

impl TierAccuracy {
    fn add(&mut self, other: &TierAccuracy) {
        self.issued_blocks += other.issued_blocks;
        self.hit_blocks += other.hit_blocks;
        self.issued_pages += other.issued_pages;
        self.hit_pages += other.hit_pages;
    }
}

/// Read-ahead accuracy broken down by admission tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchAccuracy {
    pub normal: TierAccuracy,
    pub prefetched_normal: TierAccuracy,
    pub prefetched_future: TierAccuracy,
}

impl PrefetchAccuracy {
    pub fn tier(&self, tag: AdmissionTag) -> &TierAccuracy {
        match tag {
            AdmissionTag::Normal => &self.normal,
            AdmissionTag::PrefetchedNormal => &self.prefetched_normal,
            AdmissionTag::PrefetchedFuture => &self.prefetched_future,
        }
    }

    /// Sum over all tiers.
    pub fn total(&self) -> TierAccuracy {
        let mut total = TierAccuracy::default();
        for tag in AdmissionTag::ALL {
            total.add(self.tier(tag));
        }
        total
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    last: Option<ReadAhead>,
    tiers: [TierAccuracy; 3],
}

pub struct PrefetchTracker {
    state: Mutex<TrackerState>,
    page_size: u64,
}

impl PrefetchTracker {
    pub fn new(page_size: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Record an issued read-ahead, replacing the previous one.
    pub fn record_issue(&self, key: BlockKey, iteration: u32, tier: AdmissionTag, bytes: u64) {
        let mut state = self.state.lock();
        let counters = &mut state.tiers[tier.index()];
        counters.issued_blocks += 1;
        counters.issued_pages += bytes / self.page_size;
        state.last = Some(ReadAhead {
            key,
            iteration,
            tier,
            bytes,
        });
        debug!(%key, iteration, %tier, bytes, "Read-ahead issued");
    }

    /// Forget the last read-ahead without crediting it.
    pub fn clear_last(&self) {
        self.state.lock().last = None;
    }

    /// Called when a task starts executing.
    ///
    /// `resident` is how much of the block is still resident, so bytes evicted
    /// since the read-ahead are not credited. Returns whether it matched.
    pub fn observe(&self, key: BlockKey, iteration: u32, resident: u64) -> bool {
        let mut state = self.state.lock();
        let Some(last) = state.last.take() else {
            return false;
        };
        if last.key != key || last.iteration != iteration {
            return false;
        }

        let counters = &mut state.tiers[last.tier.index()];
        counters.hit_blocks += 1;
        counters.hit_pages += last.bytes.min(resident) / self.page_size;
        true
    }

    pub fn last(&self) -> Option<ReadAhead> {
        self.state.lock().last
    }

    pub fn accuracy(&self) -> PrefetchAccuracy {
        let state = self.state.lock();
        PrefetchAccuracy {
            normal: state.tiers[AdmissionTag::Normal.index()],
            prefetched_normal: state.tiers[AdmissionTag::PrefetchedNormal.index()],
            prefetched_future: state.tiers[AdmissionTag::PrefetchedFuture.index()],
        }
    }

    pub fn clear(&self) {
        *self.state.lock() = TrackerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_task_is_credited() {
        let tracker = PrefetchTracker::new(4);
        tracker.record_issue(BlockKey::new(1, 2), 3, AdmissionTag::PrefetchedNormal, 40);
        assert!(tracker.observe(BlockKey::new(1, 2), 3, 40));

        let acc = tracker.accuracy();
        assert_eq!(acc.prefetched_normal.issued_blocks, 1);
        assert_eq!(acc.prefetched_normal.hit_blocks, 1);
        assert_eq!(acc.prefetched_normal.hit_pages, 10);
        assert_eq!(acc.normal, TierAccuracy::default());
    }

    #[test]
    fn test_other_iteration_is_not_credited() {
        let tracker = PrefetchTracker::new(4);
        tracker.record_issue(BlockKey::new(1, 2), 3, AdmissionTag::PrefetchedFuture, 40);
        assert!(!tracker.observe(BlockKey::new(1, 2), 4, 40));
        assert_eq!(tracker.accuracy().prefetched_future.hit_blocks, 0);
        // Consumed either way.
        assert!(tracker.last().is_none());
    }

    #[test]
    fn test_evicted_bytes_are_not_credited() {
        let tracker = PrefetchTracker::new(4);
        tracker.record_issue(BlockKey::new(0, 0), 0, AdmissionTag::Normal, 40);
        assert!(tracker.observe(BlockKey::new(0, 0), 0, 8));
        assert_eq!(tracker.accuracy().normal.hit_pages, 2);
    }

    #[test]
    fn test_total_and_clear() {
        let tracker = PrefetchTracker::new(4);
        tracker.record_issue(BlockKey::new(0, 0), 0, AdmissionTag::Normal, 8);
        tracker.record_issue(BlockKey::new(0, 1), 0, AdmissionTag::PrefetchedFuture, 8);
        assert_eq!(tracker.accuracy().total().issued_blocks, 2);

        tracker.clear();
        assert_eq!(tracker.accuracy(), PrefetchAccuracy::default());
        assert!(tracker.last().is_none());
    }
}
