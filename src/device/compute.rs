//! Delegates the scheduler calls out to.
//!
//! - [`EdgeProcessor`]: the per-edge accumulate step over one edge block
//! - [`IoTimer`]: assigns each submitted task its edge-block read time
//!
//! Both come with in-memory defaults so a simulator can run without a backing
//! dataset: [`InMemoryGraph`] and [`LinearIoModel`].

use std::collections::HashMap;

use crate::cache::entry::BlockKey;
use crate::device::shared::{DoneMap, Region, VertexBuffers};
use crate::sched::task::Task;

/// Performs the edge-processing work of one task.
pub trait EdgeProcessor: Send + Sync {
    /// Accumulate `src[u] / outdegree[u]` into `dst[v]` for every edge (u, v)
    /// of the task's block, then mark the block done.
    fn process(&self, task: &Task, dst: Region, src: Region, buffers: &VertexBuffers, done: &DoneMap);
}

/// Assigns simulated read latencies.
pub trait IoTimer: Send + Sync {
    /// Time to read `len` bytes at `offset` from flash (ns).
    fn read_budget_ns(&self, offset: u64, len: u64) -> u64;
}

/// Fixed per-page flash read cost.
#[derive(Debug, Clone, Copy)]
pub struct LinearIoModel {
    pub latency_ns_per_page: u64,
    pub page_size: u64,
}

impl LinearIoModel {
    pub fn new(latency_ns_per_page: u64, page_size: u64) -> Self {
        Self {
            latency_ns_per_page,
            page_size: page_size.max(1),
        }
    }
}

impl IoTimer for LinearIoModel {
    fn read_budget_ns(&self, _offset: u64, len: u64) -> u64 {
        len.div_ceil(self.page_size) * self.latency_ns_per_page
    }
}

/// Edge blocks and outdegrees held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryGraph {
    outdegree: Vec<u32>,
    blocks: HashMap<BlockKey, Vec<(u32, u32)>>,
}

impl InMemoryGraph {
    pub fn new(outdegree: Vec<u32>) -> Self {
        Self {
            outdegree,
            blocks: HashMap::new(),
        }
    }

    /// Add an edge to the block of its (row, col) partition pair.
    pub fn insert_edge(&mut self, key: BlockKey, src: u32, dst: u32) {
        self.blocks.entry(key).or_default().push((src, dst));
    }

    pub fn block(&self, key: BlockKey) -> &[(u32, u32)] {
        self.blocks.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl EdgeProcessor for InMemoryGraph {
    fn process(&self, task: &Task, dst: Region, src: Region, buffers: &VertexBuffers, done: &DoneMap) {
        let window = buffers.window_offset(task.device);
        for &(u, v) in self.block(task.key()) {
            let degree = self.outdegree.get(u as usize).copied().unwrap_or(0);
            if degree == 0 {
                continue;
            }
            let contribution = buffers.load(src, u as usize) / degree as f32;
            buffers.add(dst, v as usize + window, contribution);
        }
        done.mark(task.device, task.row, task.col);
    }
}
