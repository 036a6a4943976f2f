//! Eviction policy: decides which edge block leaves the cache next.
//!
//! Three policies are supported:
//! - `Lifo`: the most recently admitted entry
//! - `Fifo`: the least recently admitted entry
//! - `Priority`: the entry lowest in the priority order below
//!
//! Priority order, lowest first:
//! 1. `PrefetchedFuture` entries (next-iteration read-ahead)
//! 2. `PrefetchedNormal` entries
//! 3. `Normal` entries whose row is aggregation-ready
//! 4. `Normal` entries whose row is not ready yet
//!
//! Ties inside a class go to the oldest admission. The order is a strict total
//! order over `(class, seq)`, so it is also used to gate speculative admission.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::cache::entry::{AdmissionTag, BlockKey, CacheEntry};

/// Victim selection policy of the edge-block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lifo,
    Fifo,
    Priority,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lifo => write!(f, "LIFO"),
            EvictionPolicy::Fifo => write!(f, "FIFO"),
            EvictionPolicy::Priority => write!(f, "PRIORITY"),
        }
    }
}

/// Answers whether a row's upstream partition has finished aggregating.
pub trait RowReadiness {
    fn is_row_ready(&self, row: u32) -> bool;
}

impl<F> RowReadiness for F
where
    F: Fn(u32) -> bool,
{
    fn is_row_ready(&self, row: u32) -> bool {
        self(row)
    }
}

impl RowReadiness for Vec<bool> {
    fn is_row_ready(&self, row: u32) -> bool {
        self.get(row as usize).copied().unwrap_or(false)
    }
}

impl<const N: usize> RowReadiness for [bool; N] {
    fn is_row_ready(&self, row: u32) -> bool {
        self.get(row as usize).copied().unwrap_or(false)
    }
}

/// Every row is ready. Useful for recency policies and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllReady;

impl RowReadiness for AllReady {
    fn is_row_ready(&self, _row: u32) -> bool {
        true
    }
}

/// Priority class of an entry; lower classes are evicted first.
pub fn eviction_class(entry: &CacheEntry, readiness: &dyn RowReadiness) -> u8 {
    match entry.tag {
        AdmissionTag::PrefetchedFuture => 0,
        AdmissionTag::PrefetchedNormal => 1,
        AdmissionTag::Normal if readiness.is_row_ready(entry.key.row) => 2,
        AdmissionTag::Normal => 3,
    }
}

/// Whether `a` is lower priority than `b` (would be evicted before it).
pub fn is_lower_priority(a: &CacheEntry, b: &CacheEntry, readiness: &dyn RowReadiness) -> bool {
    compare_priority(a, b, readiness) == Ordering::Less
}

/// Total order used by the priority policy.
pub fn compare_priority(a: &CacheEntry, b: &CacheEntry, readiness: &dyn RowReadiness) -> Ordering {
    (eviction_class(a, readiness), a.seq).cmp(&(eviction_class(b, readiness), b.seq))
}

/// An eviction candidate with its priority key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: BlockKey,
    pub class: u8,
    pub seq: u64,
}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Smaller (class, seq) = evicted earlier.
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.class, self.seq).cmp(&(other.class, other.seq))
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Position of the next victim among `entries` (which are in admission order).
    pub fn select_victim<'a, I>(&self, entries: I, readiness: &dyn RowReadiness) -> Option<usize>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut iter = entries.into_iter();
        let len = iter.len();
        if len == 0 {
            return None;
        }

        match self.policy {
            EvictionPolicy::Fifo => Some(0),
            EvictionPolicy::Lifo => Some(len - 1),
            EvictionPolicy::Priority => {
                let first = iter.next()?;
                let mut victim = (0, first);
                for (pos, entry) in iter.enumerate() {
                    if is_lower_priority(entry, victim.1, readiness) {
                        victim = (pos + 1, entry);
                    }
                }
                Some(victim.0)
            }
        }
    }

    /// The first `count` entries in the order the priority policy would evict them.
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry>,
        count: usize,
        readiness: &dyn RowReadiness,
    ) -> Vec<EvictionCandidate> {
        let mut heap = BinaryHeap::new();
        for entry in entries {
            heap.push(Reverse(EvictionCandidate {
                key: entry.key,
                class: eviction_class(entry, readiness),
                seq: entry.seq,
            }));
        }

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(Reverse(candidate)) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(row: u32, col: u32, tag: AdmissionTag, seq: u64) -> CacheEntry {
        CacheEntry {
            key: BlockKey::new(row, col),
            size: 1,
            tag,
            seq,
        }
    }

    #[test]
    fn test_prefetched_future_is_always_lowest() {
        let ready = |_row: u32| false;
        let pf = entry(0, 0, AdmissionTag::PrefetchedFuture, 10);
        let n = entry(1, 1, AdmissionTag::Normal, 0);
        let pn = entry(2, 2, AdmissionTag::PrefetchedNormal, 1);
        assert!(is_lower_priority(&pf, &n, &ready));
        assert!(is_lower_priority(&pf, &pn, &ready));
        assert!(!is_lower_priority(&n, &pf, &ready));
    }

    #[test]
    fn test_not_ready_normal_is_protected() {
        let ready = [false, false, true];
        let not_ready = entry(1, 0, AdmissionTag::Normal, 0);
        let is_ready = entry(2, 0, AdmissionTag::Normal, 5);
        assert!(is_lower_priority(&is_ready, &not_ready, &ready));
    }

    #[test]
    fn test_prefetched_normal_before_ready_normal() {
        let pn = entry(3, 0, AdmissionTag::PrefetchedNormal, 9);
        let n = entry(4, 0, AdmissionTag::Normal, 1);
        assert!(is_lower_priority(&pn, &n, &AllReady));
    }

    #[test]
    fn test_ties_go_to_oldest() {
        let older = entry(1, 0, AdmissionTag::Normal, 1);
        let newer = entry(1, 1, AdmissionTag::Normal, 2);
        assert!(is_lower_priority(&older, &newer, &AllReady));
        assert!(!is_lower_priority(&newer, &older, &AllReady));
    }

    #[test]
    fn test_order_is_irreflexive() {
        let e = entry(1, 0, AdmissionTag::PrefetchedFuture, 3);
        assert!(!is_lower_priority(&e, &e, &AllReady));
    }

    #[test]
    fn test_recency_policies_ignore_tags() {
        let entries = vec![
            entry(0, 0, AdmissionTag::Normal, 0),
            entry(0, 1, AdmissionTag::PrefetchedFuture, 1),
            entry(0, 2, AdmissionTag::Normal, 2),
        ];
        assert_eq!(Evictor::new(EvictionPolicy::Fifo).select_victim(&entries, &AllReady), Some(0));
        assert_eq!(Evictor::new(EvictionPolicy::Lifo).select_victim(&entries, &AllReady), Some(2));
        assert_eq!(
            Evictor::new(EvictionPolicy::Priority).select_victim(&entries, &AllReady),
            Some(1)
        );
    }

    #[test]
    fn test_select_victims_ordering() {
        let ready = [true, false];
        let entries = vec![
            entry(1, 0, AdmissionTag::Normal, 0),
            entry(0, 0, AdmissionTag::Normal, 1),
            entry(0, 1, AdmissionTag::PrefetchedNormal, 2),
        ];
        let victims =
            Evictor::new(EvictionPolicy::Priority).select_victims(entries.iter(), 3, &ready);
        let keys: Vec<_> = victims.iter().map(|v| v.key).collect();
        assert_eq!(
            keys,
            vec![BlockKey::new(0, 1), BlockKey::new(0, 0), BlockKey::new(1, 0)]
        );
    }

    #[test]
    fn test_empty_has_no_victim() {
        let entries: Vec<CacheEntry> = Vec::new();
        assert_eq!(
            Evictor::new(EvictionPolicy::Priority).select_victim(&entries, &AllReady),
            None
        );
    }
}
