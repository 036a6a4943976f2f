//! Cache entry keys and admission tags.
//!
//! An edge block is keyed by its (row, col) partition pair, a vertex partition
//! by (partition id, version). Edge-block entries additionally carry an
//! [`AdmissionTag`] recording why they were admitted; only the priority
//! eviction policy looks at it.

use serde::{Deserialize, Serialize};

/// Identifies an edge block: edges whose source partition is `row` and
/// destination partition is `col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub row: u32,
    pub col: u32,
}

impl BlockKey {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E[{},{}]", self.row, self.col)
    }
}

/// Identifies a resident vertex partition of a given iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub partition: u32,
    pub version: u32,
}

impl PartitionKey {
    pub fn new(partition: u32, version: u32) -> Self {
        Self { partition, version }
    }
}

/// Why an edge-block entry was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionTag {
    /// Demand access, or a read-ahead of pending future work.
    Normal,
    /// Read-ahead of a normal-queue task issued while computing future values.
    PrefetchedNormal,
    /// Read-ahead of next-iteration work. Always the first to go.
    PrefetchedFuture,
}

impl AdmissionTag {
    /// All tags, in the order flush reports list them.
    pub const ALL: [AdmissionTag; 3] = [
        AdmissionTag::Normal,
        AdmissionTag::PrefetchedNormal,
        AdmissionTag::PrefetchedFuture,
    ];

    /// Dense index for per-tag counter arrays.
    pub fn index(self) -> usize {
        match self {
            AdmissionTag::Normal => 0,
            AdmissionTag::PrefetchedNormal => 1,
            AdmissionTag::PrefetchedFuture => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionTag::Normal => "normal",
            AdmissionTag::PrefetchedNormal => "prefetched_normal",
            AdmissionTag::PrefetchedFuture => "prefetched_future",
        }
    }
}

impl std::fmt::Display for AdmissionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The purpose of a cache access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessIntent {
    /// The scheduler is about to consume the block.
    Demand,
    /// Speculative fill for a pending future task.
    ReadAhead,
    /// Speculative fill for the normal queue issued from the future lane.
    ReadAheadNormal,
    /// Speculative fill for work of a later iteration.
    ReadAheadNextIteration,
}

impl AccessIntent {
    /// Tag stored on the entry admitted by this access.
    pub fn admission_tag(self) -> AdmissionTag {
        match self {
            AccessIntent::Demand | AccessIntent::ReadAhead => AdmissionTag::Normal,
            AccessIntent::ReadAheadNormal => AdmissionTag::PrefetchedNormal,
            AccessIntent::ReadAheadNextIteration => AdmissionTag::PrefetchedFuture,
        }
    }

    /// Speculative accesses may be refused room and never touch hit counters.
    pub fn is_speculative(self) -> bool {
        !matches!(self, AccessIntent::Demand)
    }
}

/// A resident edge block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: BlockKey,

    /// Bytes currently resident (never more than requested or than capacity).
    pub size: u64,

    pub tag: AdmissionTag,

    /// Monotonic insertion sequence; lower is older.
    pub seq: u64,
}

/// A resident vertex partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub key: PartitionKey,
    pub size: u64,
}
