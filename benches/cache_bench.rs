//! Benchmarks for the edge cache and task queues.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use csd_sim::cache::edge_cache::BlockCache;
use csd_sim::cache::entry::{AccessIntent, AdmissionTag, BlockKey, CacheEntry};
use csd_sim::cache::evictor::{EvictionPolicy, Evictor};
use csd_sim::config::EdgeCacheConfig;
use csd_sim::sched::queue::TaskQueue;
use csd_sim::sched::task::{RowOverlap, Task};

fn bench_priority_victim(c: &mut Criterion) {
    let evictor = Evictor::new(EvictionPolicy::Priority);
    let tags = [
        AdmissionTag::Normal,
        AdmissionTag::PrefetchedNormal,
        AdmissionTag::PrefetchedFuture,
    ];

    // 10,000 entries over 64 rows, mixed tags.
    let entries: Vec<CacheEntry> = (0..10_000u64)
        .map(|i| CacheEntry {
            key: BlockKey::new((i % 64) as u32, (i / 64) as u32),
            size: 4096,
            tag: tags[(i % 7 % 3) as usize],
            seq: i,
        })
        .collect();
    let ready: Vec<bool> = (0..64).map(|row| row % 3 == 0).collect();

    c.bench_function("priority_select_victim_10k", |b| {
        b.iter(|| black_box(evictor.select_victim(black_box(&entries), &ready)))
    });

    c.bench_function("priority_select_100_from_10k", |b| {
        b.iter(|| black_box(evictor.select_victims(black_box(entries.iter()), 100, &ready)))
    });
}

fn bench_cache_churn(c: &mut Criterion) {
    let config = EdgeCacheConfig {
        capacity_bytes: 256 * 4096,
        policy: EvictionPolicy::Priority,
        partial_eviction: true,
        invalidate_at_future_value: false,
        max_entries: None,
    };
    let ready: Vec<bool> = (0..32).map(|row| row % 2 == 0).collect();

    c.bench_function("edge_cache_access_1k_over_capacity", |b| {
        let cache = BlockCache::new(&config, 4096);
        b.iter(|| {
            for i in 0..1_000u32 {
                let key = BlockKey::new(i % 32, i / 32);
                black_box(cache.access(key, 6144, AccessIntent::Demand, &ready).ok());
            }
        })
    });
}

fn task(row: u32) -> Task {
    Task {
        outdegree_offset: 0,
        outdegree_len: 0,
        edge_block_offset: 0,
        edge_block_len: 4096,
        row,
        col: 0,
        iteration: 0,
        num_iterations: 2,
        device: 0,
        num_devices: 1,
        num_partitions: 1024,
        num_vertices: 1 << 20,
        namespace: 0,
        row_overlap: RowOverlap::ScanForward,
        prefetch_level: 0,
        time_budget_ns: 0,
    }
}

fn bench_queue_scan(c: &mut Criterion) {
    let queue = TaskQueue::new("future");
    for row in 0..1_024 {
        queue.enqueue(task(row)).unwrap();
    }

    c.bench_function("queue_scan_forward_1k", |b| {
        b.iter(|| black_box(queue.find_next(|row| row == 1_000, RowOverlap::ScanForward, false)))
    });

    c.bench_function("queue_scan_backward_1k", |b| {
        b.iter(|| black_box(queue.find_next(|row| row == 10, RowOverlap::ScanBackward, false)))
    });
}

criterion_group!(benches, bench_priority_victim, bench_cache_churn, bench_queue_scan);
criterion_main!(benches);
