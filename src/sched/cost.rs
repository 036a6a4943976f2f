//! Time accounting and pipelining math.
//!
//! A processed task is charged three kinds of time:
//! - compute: edge processing, stretched to MCU speed
//! - internal I/O: edge-block reads from flash, scaled by the uncached fraction
//! - external I/O: vertex-partition traffic and barrier waits
//!
//! When a task's compute time overlaps its own fetch, part of the fetch is
//! hidden; whatever compute time is left over can be spent reading ahead.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Accumulated time per category, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CostTotals {
    pub compute_ms: u64,
    pub internal_io_ms: u64,
    pub external_io_ms: u64,
}

/// Result of overlapping a task's compute with its own edge-block fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pipeline {
    /// Bytes of the fetch hidden behind compute (credited as hits).
    pub overlap_bytes: u64,

    /// Fraction of the time budget still to be waited for.
    pub remaining_ratio: f64,

    /// Compute time left over for read-ahead (ns).
    pub prefetch_budget_ns: i64,
}

const NS_PER_MS: u64 = 1_000_000;

/// Per-device time ledger.
#[derive(Debug)]
pub struct CostModel {
    compute_ns: AtomicU64,
    internal_io_ns: AtomicU64,
    external_io_ns: AtomicU64,
    mcu_speed_ratio: f64,
}

impl CostModel {
    pub fn new(mcu_speed_ratio: f64) -> Self {
        Self {
            compute_ns: AtomicU64::new(0),
            internal_io_ns: AtomicU64::new(0),
            external_io_ns: AtomicU64::new(0),
            mcu_speed_ratio,
        }
    }

    pub fn add_compute(&self, ns: u64) {
        self.compute_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_internal_io(&self, ns: u64) {
        self.internal_io_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_external_io(&self, ns: u64) {
        self.external_io_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn totals(&self) -> CostTotals {
        CostTotals {
            compute_ms: self.compute_ns.load(Ordering::Relaxed) / NS_PER_MS,
            internal_io_ms: self.internal_io_ns.load(Ordering::Relaxed) / NS_PER_MS,
            external_io_ms: self.external_io_ns.load(Ordering::Relaxed) / NS_PER_MS,
        }
    }

    /// Raw compute total (ns).
    pub fn compute_ns(&self) -> u64 {
        self.compute_ns.load(Ordering::Relaxed)
    }

    pub fn internal_io_ns(&self) -> u64 {
        self.internal_io_ns.load(Ordering::Relaxed)
    }

    pub fn external_io_ns(&self) -> u64 {
        self.external_io_ns.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.compute_ns.store(0, Ordering::Relaxed);
        self.internal_io_ns.store(0, Ordering::Relaxed);
        self.external_io_ns.store(0, Ordering::Relaxed);
    }

    /// Extra time to wait after a host-speed computation of `elapsed_ns`.
    pub fn mcu_extra_ns(&self, elapsed_ns: u64) -> u64 {
        let extra = (self.mcu_speed_ratio - 1.0) * elapsed_ns as f64;
        if extra > 0.0 {
            extra as u64
        } else {
            0
        }
    }

    /// Fraction of a block that still has to be fetched.
    pub fn service_ratio(not_resident: u64, len: u64) -> f64 {
        if len == 0 {
            1.0
        } else {
            not_resident as f64 / len as f64
        }
    }

    /// Overlap a task's compute (`proc_ns`) with its own fetch.
    ///
    /// `ratio` is the uncached fraction of the block, `budget_ns` the time the
    /// full fetch would take.
    pub fn pipeline(proc_ns: u64, budget_ns: u64, ratio: f64, len: u64, not_resident: u64) -> Pipeline {
        let pipeline_ratio = if budget_ns == 0 {
            0.0
        } else {
            proc_ns as f64 / budget_ns as f64
        };
        let prefetch_ratio = (pipeline_ratio - ratio).max(0.0);
        let overlap_bytes = ((pipeline_ratio * ratio * len as f64) as u64).min(not_resident);

        Pipeline {
            overlap_bytes,
            remaining_ratio: (ratio - pipeline_ratio).max(0.0),
            prefetch_budget_ns: (prefetch_ratio * budget_ns as f64) as i64,
        }
    }

    /// Plan a read-ahead of a block with `len` bytes, `resident` of them cached,
    /// whose full fetch takes `budget_ns`.
    ///
    /// Consumes from `leftover_ns` and returns the resident size to reach, or
    /// `None` when there is nothing to do.
    pub fn prefetch_fill(leftover_ns: &mut i64, len: u64, resident: u64, budget_ns: u64) -> Option<u64> {
        if len == 0 || *leftover_ns <= 0 || resident >= len {
            return None;
        }

        let ratio = if budget_ns == 0 {
            1.0
        } else {
            (*leftover_ns as f64 / budget_ns as f64).min(1.0)
        };
        let missing = (len - resident) as f64 / len as f64;
        *leftover_ns -= (budget_ns as f64 * missing) as i64;

        Some((resident + (len as f64 * ratio) as u64).min(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_ratio() {
        assert_eq!(CostModel::service_ratio(0, 0), 1.0);
        assert_eq!(CostModel::service_ratio(50, 100), 0.5);
    }

    #[test]
    fn test_pipeline_hides_fetch() {
        // Compute takes half the fetch budget, whole block uncached.
        let p = CostModel::pipeline(500, 1_000, 1.0, 4096, 4096);
        assert_eq!(p.overlap_bytes, 2048);
        assert!((p.remaining_ratio - 0.5).abs() < 1e-9);
        assert_eq!(p.prefetch_budget_ns, 0);
    }

    #[test]
    fn test_pipeline_leftover_for_read_ahead() {
        // Compute is twice the budget and a quarter is uncached.
        let p = CostModel::pipeline(2_000, 1_000, 0.25, 4096, 1024);
        assert_eq!(p.overlap_bytes, 1024);
        assert_eq!(p.remaining_ratio, 0.0);
        assert_eq!(p.prefetch_budget_ns, 1_750);
    }

    #[test]
    fn test_pipeline_zero_budget() {
        let p = CostModel::pipeline(2_000, 0, 1.0, 4096, 4096);
        assert_eq!(p.overlap_bytes, 0);
        assert_eq!(p.remaining_ratio, 1.0);
        assert_eq!(p.prefetch_budget_ns, 0);
    }

    #[test]
    fn test_prefetch_fill_partial() {
        let mut leftover = 500;
        let target = CostModel::prefetch_fill(&mut leftover, 4096, 0, 1_000);
        assert_eq!(target, Some(2048));
        assert_eq!(leftover, -500);
    }

    #[test]
    fn test_prefetch_fill_skips() {
        let mut leftover = 0;
        assert_eq!(CostModel::prefetch_fill(&mut leftover, 4096, 0, 1_000), None);
        let mut leftover = 100;
        assert_eq!(CostModel::prefetch_fill(&mut leftover, 0, 0, 1_000), None);
        assert_eq!(CostModel::prefetch_fill(&mut leftover, 64, 64, 1_000), None);
        assert_eq!(leftover, 100);
    }

    #[test]
    fn test_mcu_compensation() {
        let cost = CostModel::new(1.5);
        assert_eq!(cost.mcu_extra_ns(1_000), 500);
        let fast = CostModel::new(0.5);
        assert_eq!(fast.mcu_extra_ns(1_000), 0);
    }

    #[test]
    fn test_totals_in_ms() {
        let cost = CostModel::new(1.0);
        cost.add_compute(3_000_000);
        cost.add_internal_io(1_500_000);
        cost.add_external_io(999_999);
        assert_eq!(
            cost.totals(),
            CostTotals {
                compute_ms: 3,
                internal_io_ms: 1,
                external_io_ms: 0
            }
        );
        cost.clear();
        assert_eq!(cost.totals(), CostTotals::default());
    }
}
