//! Scheduling unit and its wire record.
//!
//! A [`Task`] asks a device to process one edge block (row, col) for one
//! iteration. Tasks are plain values: queues copy them, nothing points back.
//! Hosts submit them either as JSON or as the packed [`TaskRecord`].

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::cache::entry::BlockKey;
use crate::config::VERTEX_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Task record must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Unknown row-overlap selector {0}")]
    RowOverlap(u8),
}

/// How the future queue may be scanned for an aggregation-ready task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOverlap {
    /// Strict FIFO: only the front task is considered.
    #[default]
    None,
    /// First ready task scanning from the head.
    ScanForward,
    /// First ready task scanning from the tail.
    ScanBackward,
}

impl RowOverlap {
    pub fn is_active(self) -> bool {
        self != RowOverlap::None
    }
}

impl TryFrom<u8> for RowOverlap {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RowOverlap::None),
            1 => Ok(RowOverlap::ScanForward),
            2 => Ok(RowOverlap::ScanBackward),
            other => Err(WireError::RowOverlap(other)),
        }
    }
}

impl From<RowOverlap> for u8 {
    fn from(value: RowOverlap) -> Self {
        match value {
            RowOverlap::None => 0,
            RowOverlap::ScanForward => 1,
            RowOverlap::ScanBackward => 2,
        }
    }
}

/// Which value a task computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Current-iteration values (normal queue).
    Normal,
    /// Next-iteration values computed ahead of time (future queue).
    Future,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Normal => "normal",
            Lane::Future => "future",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One edge-block processing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Byte offset of the source outdegree table in the device namespace.
    #[serde(default)]
    pub outdegree_offset: u64,
    #[serde(default)]
    pub outdegree_len: u32,

    /// Byte offset and length of the edge block.
    #[serde(default)]
    pub edge_block_offset: u64,
    pub edge_block_len: u32,

    pub row: u32,
    pub col: u32,
    pub iteration: u32,
    pub num_iterations: u32,

    pub device: u32,
    pub num_devices: u32,
    pub num_partitions: u32,
    pub num_vertices: u32,

    #[serde(default)]
    pub namespace: u32,

    #[serde(default)]
    pub row_overlap: RowOverlap,

    /// 0 = none, 1 = overlap credit, 2+ = overlap credit and read-ahead.
    #[serde(default)]
    pub prefetch_level: u8,

    /// Simulated edge-block read time assigned at submission.
    #[serde(default)]
    pub time_budget_ns: u64,
}

impl Task {
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.row, self.col)
    }

    /// Structural identity used to deduplicate submissions.
    pub fn same_work(&self, row: u32, col: u32, device: u32, iteration: u32) -> bool {
        self.row == row && self.col == col && self.device == device && self.iteration == iteration
    }

    fn last_partition(&self) -> Option<u32> {
        self.num_partitions.checked_sub(1)
    }

    /// Whether this task at the front of the future queue ends the current
    /// half-iteration and triggers the barrier and queue swap.
    ///
    /// Iterations alternate direction: after an even iteration the sweep ends
    /// on the last row, after an odd one on row 0.
    pub fn is_closing(&self) -> bool {
        if self.iteration == self.num_iterations {
            return true;
        }
        match self.iteration.checked_sub(1) {
            Some(prev) if prev % 2 == 0 => Some(self.row) == self.last_partition(),
            Some(_) => self.row == 0,
            None => false,
        }
    }

    /// Whether a normal-lane task also contributes to next-iteration values:
    /// the upper triangle (row <= col) on even iterations, strictly lower on odd.
    pub fn advances_to_future(&self) -> bool {
        if self.iteration.wrapping_add(1) == self.num_iterations {
            return false;
        }
        if self.iteration % 2 == 0 {
            self.row <= self.col
        } else {
            self.row > self.col
        }
    }

    /// Bytes of one vertex partition. Logs and yields 0 when there are no partitions.
    pub fn partition_bytes(&self) -> u64 {
        if self.num_partitions == 0 {
            error!(
                device = self.device,
                row = self.row,
                col = self.col,
                "Partition size is zero: task carries no partitions"
            );
            return 0;
        }
        u64::from(self.num_vertices) * VERTEX_SIZE / u64::from(self.num_partitions)
    }

    /// A copy of this task retargeted at another block and iteration.
    pub fn sentinel(&self, row: u32, col: u32, iteration: u32) -> Task {
        Task {
            row,
            col,
            iteration,
            ..*self
        }
    }
}

/// Packed little-endian wire layout of a [`Task`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct TaskRecord {
    pub outdegree_offset: u64,
    pub edge_block_offset: u64,
    pub time_budget_ns: u64,
    pub edge_block_len: u32,
    pub outdegree_len: u32,
    pub row: u32,
    pub col: u32,
    pub iteration: u32,
    pub num_iterations: u32,
    pub device: u32,
    pub num_devices: u32,
    pub num_partitions: u32,
    pub num_vertices: u32,
    pub namespace: u32,
    pub row_overlap: u8,
    pub prefetch_level: u8,
    pub reserved: [u8; 2],
}

impl TaskRecord {
    pub const SIZE: usize = std::mem::size_of::<TaskRecord>();

    /// Decode and validate a record.
    pub fn decode(bytes: &[u8]) -> Result<Task, WireError> {
        if bytes.len() != Self::SIZE {
            return Err(WireError::Length {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let record: TaskRecord = bytemuck::pod_read_unaligned(bytes);
        Task::try_from(record)
    }

    pub fn encode(task: &Task) -> Bytes {
        let record = TaskRecord::from(*task);
        Bytes::copy_from_slice(bytemuck::bytes_of(&record))
    }
}

impl From<Task> for TaskRecord {
    fn from(task: Task) -> Self {
        Self {
            outdegree_offset: task.outdegree_offset.to_le(),
            edge_block_offset: task.edge_block_offset.to_le(),
            time_budget_ns: task.time_budget_ns.to_le(),
            edge_block_len: task.edge_block_len.to_le(),
            outdegree_len: task.outdegree_len.to_le(),
            row: task.row.to_le(),
            col: task.col.to_le(),
            iteration: task.iteration.to_le(),
            num_iterations: task.num_iterations.to_le(),
            device: task.device.to_le(),
            num_devices: task.num_devices.to_le(),
            num_partitions: task.num_partitions.to_le(),
            num_vertices: task.num_vertices.to_le(),
            namespace: task.namespace.to_le(),
            row_overlap: task.row_overlap.into(),
            prefetch_level: task.prefetch_level,
            reserved: [0; 2],
        }
    }
}

impl TryFrom<TaskRecord> for Task {
    type Error = WireError;

    fn try_from(record: TaskRecord) -> Result<Self, Self::Error> {
        Ok(Task {
            outdegree_offset: u64::from_le(record.outdegree_offset),
            outdegree_len: u32::from_le(record.outdegree_len),
            edge_block_offset: u64::from_le(record.edge_block_offset),
            edge_block_len: u32::from_le(record.edge_block_len),
            row: u32::from_le(record.row),
            col: u32::from_le(record.col),
            iteration: u32::from_le(record.iteration),
            num_iterations: u32::from_le(record.num_iterations),
            device: u32::from_le(record.device),
            num_devices: u32::from_le(record.num_devices),
            num_partitions: u32::from_le(record.num_partitions),
            num_vertices: u32::from_le(record.num_vertices),
            namespace: u32::from_le(record.namespace),
            row_overlap: RowOverlap::try_from(record.row_overlap)?,
            prefetch_level: record.prefetch_level,
            time_budget_ns: u64::from_le(record.time_budget_ns),
        })
    }
}
