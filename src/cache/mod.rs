//! On-device DRAM caches.
//!
//! This module contains the residency caches and their policies:
//! - [`entry`]: BlockKey, PartitionKey, AdmissionTag, AccessIntent
//! - [`evictor`]: Eviction policies and the priority order
//! - [`edge_cache`]: BlockCache for edge blocks
//! - [`vertex_cache`]: PartitionCache for vertex partitions
//! - [`prefetcher`]: Read-ahead accuracy tracking

pub mod edge_cache;
pub mod entry;
pub mod evictor;
pub mod prefetcher;
pub mod vertex_cache;

pub use edge_cache::{AccessStats, BlockCache, CacheError};
pub use entry::{AccessIntent, AdmissionTag, BlockKey, CacheEntry, PartitionKey};
pub use evictor::{EvictionPolicy, Evictor, RowReadiness};
pub use prefetcher::{PrefetchAccuracy, PrefetchTracker};
pub use vertex_cache::{PartitionAccess, PartitionCache};
