//! State shared by every device and the upstream aggregator.
//!
//! - [`ReadinessSignal`]: per-partition aggregation flags plus per-device
//!   barrier-arrival flags
//! - [`VertexBuffers`]: the three rotating vertex-value regions
//! - [`DoneMap`]: which (device, row, col) blocks finished in a lane
//!
//! Nothing here takes a lock. Each device only writes its own slots, and
//! readers tolerate observing a flag one poll late.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cache::evictor::RowReadiness;
use crate::config::TopologyConfig;
use crate::sched::task::Lane;

/// Aggregation readiness and barrier flags.
///
/// Layout: `[0, P)` partition flags, `P` unused, `P + 1 + d` barrier flag of
/// device `d`.
#[derive(Debug)]
pub struct ReadinessSignal {
    flags: Vec<AtomicBool>,
    num_partitions: u32,
    num_devices: u32,
}

impl ReadinessSignal {
    pub fn new(num_partitions: u32, num_devices: u32) -> Self {
        let len = num_partitions as usize + num_devices as usize + 1;
        Self {
            flags: (0..len).map(|_| AtomicBool::new(false)).collect(),
            num_partitions,
            num_devices,
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn num_devices(&self) -> u32 {
        self.num_devices
    }

    /// Whether a partition's aggregation has completed. Out of range reads as not ready.
    pub fn is_ready(&self, partition: u32) -> bool {
        if partition >= self.num_partitions {
            return false;
        }
        self.flags[partition as usize].load(Ordering::Acquire)
    }

    pub fn set_ready(&self, partition: u32, ready: bool) -> bool {
        if partition >= self.num_partitions {
            return false;
        }
        self.flags[partition as usize].store(ready, Ordering::Release);
        true
    }

    /// Clear every partition flag.
    pub fn reset_partitions(&self) {
        for flag in &self.flags[..self.num_partitions as usize] {
            flag.store(false, Ordering::Release);
        }
    }

    fn barrier_slot(&self, device: u32) -> Option<&AtomicBool> {
        if device >= self.num_devices {
            return None;
        }
        self.flags
            .get(self.num_partitions as usize + 1 + device as usize)
    }

    /// Announce that `device` reached the end-of-iteration barrier.
    pub fn announce_barrier(&self, device: u32) -> bool {
        match self.barrier_slot(device) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Whether `device`'s barrier announcement is still outstanding.
    pub fn barrier_pending(&self, device: u32) -> bool {
        self.barrier_slot(device)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Acknowledge `device`'s announcement (done by the aggregator).
    pub fn clear_barrier(&self, device: u32) -> bool {
        match self.barrier_slot(device) {
            Some(flag) => {
                flag.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Partition flags as plain booleans.
    pub fn partitions(&self) -> Vec<bool> {
        self.flags[..self.num_partitions as usize]
            .iter()
            .map(|f| f.load(Ordering::Acquire))
            .collect()
    }
}

impl RowReadiness for ReadinessSignal {
    fn is_row_ready(&self, row: u32) -> bool {
        self.is_ready(row)
    }
}

/// The three vertex-value regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Values of the previous iteration (normal-lane source).
    Previous,
    /// Values being computed this iteration (normal-lane destination, future-lane source).
    Current,
    /// Next-iteration values computed ahead (future-lane destination).
    Next,
}

/// Shared vertex values stored as `f32` bits.
///
/// Each region holds a shared window at offset 0 followed by one window of
/// `num_vertices` values per device at `(device + 1) * num_vertices`.
#[derive(Debug)]
pub struct VertexBuffers {
    previous: Vec<AtomicU32>,
    current: Vec<AtomicU32>,
    next: Vec<AtomicU32>,
    num_vertices: u32,
}

fn zeroed(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(0f32.to_bits())).collect()
}

impl VertexBuffers {
    pub fn new(num_vertices: u32, num_devices: u32) -> Self {
        let len = (num_devices as usize + 1) * num_vertices as usize;
        Self {
            previous: zeroed(len),
            current: zeroed(len),
            next: zeroed(len),
            num_vertices,
        }
    }

    pub fn num_vertices(&self) -> u32 {
        self.num_vertices
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    fn region(&self, region: Region) -> &[AtomicU32] {
        match region {
            Region::Previous => &self.previous,
            Region::Current => &self.current,
            Region::Next => &self.next,
        }
    }

    /// Offset of `device`'s private window.
    pub fn window_offset(&self, device: u32) -> usize {
        (device as usize + 1) * self.num_vertices as usize
    }

    pub fn load(&self, region: Region, index: usize) -> f32 {
        self.region(region)
            .get(index)
            .map(|v| f32::from_bits(v.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub fn store(&self, region: Region, index: usize, value: f32) {
        if let Some(slot) = self.region(region).get(index) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    /// Atomically add `delta` to a value.
    pub fn add(&self, region: Region, index: usize, delta: f32) {
        let Some(slot) = self.region(region).get(index) else {
            return;
        };
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let updated = (f32::from_bits(current) + delta).to_bits();
            match slot.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// End-of-iteration rotation of one device window: next becomes current,
    /// next is cleared.
    pub fn rotate_device_window(&self, device: u32) {
        let start = self.window_offset(device);
        let end = (start + self.num_vertices as usize).min(self.len());
        for v in start..end {
            let next = self.next[v].swap(0f32.to_bits(), Ordering::Relaxed);
            self.current[v].store(next, Ordering::Relaxed);
        }
    }
}

/// Completion flags of one lane, indexed by (device, row, col).
#[derive(Debug)]
pub struct DoneMap {
    flags: Vec<AtomicBool>,
    num_partitions: u32,
}

impl DoneMap {
    pub fn new(num_devices: u32, num_partitions: u32) -> Self {
        let p = num_partitions as usize;
        Self {
            flags: (0..num_devices as usize * p * p)
                .map(|_| AtomicBool::new(false))
                .collect(),
            num_partitions,
        }
    }

    fn index(&self, device: u32, row: u32, col: u32) -> Option<usize> {
        if row >= self.num_partitions || col >= self.num_partitions {
            return None;
        }
        let p = self.num_partitions as usize;
        let idx = device as usize * p * p + row as usize * p + col as usize;
        (idx < self.flags.len()).then_some(idx)
    }

    pub fn mark(&self, device: u32, row: u32, col: u32) {
        if let Some(idx) = self.index(device, row, col) {
            self.flags[idx].store(true, Ordering::Release);
        }
    }

    pub fn is_done(&self, device: u32, row: u32, col: u32) -> bool {
        self.index(device, row, col)
            .map(|idx| self.flags[idx].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.load(Ordering::Acquire))
            .count()
    }

    pub fn clear(&self) {
        for flag in &self.flags {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Everything devices share with each other and with the aggregator.
#[derive(Debug)]
pub struct SharedState {
    pub readiness: ReadinessSignal,
    pub buffers: VertexBuffers,
    pub done_normal: DoneMap,
    pub done_future: DoneMap,
}

impl SharedState {
    pub fn new(topology: &TopologyConfig) -> Self {
        Self {
            readiness: ReadinessSignal::new(topology.num_partitions, topology.num_devices),
            buffers: VertexBuffers::new(topology.num_vertices, topology.num_devices),
            done_normal: DoneMap::new(topology.num_devices, topology.num_partitions),
            done_future: DoneMap::new(topology.num_devices, topology.num_partitions),
        }
    }

    pub fn done(&self, lane: Lane) -> &DoneMap {
        match lane {
            Lane::Normal => &self.done_normal,
            Lane::Future => &self.done_future,
        }
    }
}

/// Destination and source regions of a lane.
pub fn lane_regions(lane: Lane) -> (Region, Region) {
    match lane {
        Lane::Normal => (Region::Current, Region::Previous),
        Lane::Future => (Region::Next, Region::Current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_flags() {
        let signal = ReadinessSignal::new(4, 2);
        assert!(!signal.is_ready(1));
        assert!(signal.set_ready(1, true));
        assert!(signal.is_ready(1));
        assert!(signal.is_row_ready(1));
        assert!(!signal.set_ready(9, true));
        assert!(!signal.is_ready(9));

        signal.reset_partitions();
        assert_eq!(signal.partitions(), vec![false; 4]);
    }

    #[test]
    fn test_barrier_flags_are_separate() {
        let signal = ReadinessSignal::new(4, 2);
        assert!(signal.announce_barrier(1));
        assert!(signal.barrier_pending(1));
        assert!(!signal.barrier_pending(0));
        assert_eq!(signal.partitions(), vec![false; 4]);
        assert!(signal.clear_barrier(1));
        assert!(!signal.barrier_pending(1));
        assert!(!signal.announce_barrier(2));
    }

    #[test]
    fn test_rotate_device_window() {
        let buffers = VertexBuffers::new(4, 2);
        let w = buffers.window_offset(1);
        buffers.store(Region::Next, w, 2.5);
        buffers.store(Region::Current, w, 1.0);
        buffers.store(Region::Next, buffers.window_offset(0), 7.0);

        buffers.rotate_device_window(1);
        assert_eq!(buffers.load(Region::Current, w), 2.5);
        assert_eq!(buffers.load(Region::Next, w), 0.0);
        // Other devices' windows are untouched.
        assert_eq!(buffers.load(Region::Next, buffers.window_offset(0)), 7.0);
    }

    #[test]
    fn test_atomic_add() {
        let buffers = VertexBuffers::new(2, 1);
        buffers.add(Region::Current, 3, 0.5);
        buffers.add(Region::Current, 3, 0.25);
        assert_eq!(buffers.load(Region::Current, 3), 0.75);
    }

    #[test]
    fn test_done_map() {
        let done = DoneMap::new(2, 3);
        done.mark(1, 2, 0);
        assert!(done.is_done(1, 2, 0));
        assert!(!done.is_done(0, 2, 0));
        assert!(!done.is_done(1, 3, 0));
        assert_eq!(done.count(), 1);
        done.clear();
        assert_eq!(done.count(), 0);
    }
}
