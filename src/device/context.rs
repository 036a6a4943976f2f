//! Per-device context.
//!
//! A [`DeviceContext`] owns everything private to one simulated device: the
//! edge and vertex caches, the normal and future queues, the time ledger and
//! the read-ahead tracker. It is built once per device and handed by `Arc` to
//! the device's scheduler, to the simulator and to the control plane.
//!
//! Host commands arrive through [`DeviceContext::submit`] and
//! [`DeviceContext::flush`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::edge_cache::{AccessStats, BlockCache, CacheError};
use crate::cache::entry::{AccessIntent, PartitionKey};
use crate::cache::prefetcher::{PrefetchAccuracy, PrefetchTracker};
use crate::cache::vertex_cache::PartitionCache;
use crate::config::Config;
use crate::device::compute::{EdgeProcessor, IoTimer};
use crate::device::shared::{lane_regions, Region, SharedState};
use crate::metrics::SimMetrics;
use crate::sched::clock::SimClock;
use crate::sched::cost::{CostModel, CostTotals};
use crate::sched::queue::{QueueError, TaskQueue};
use crate::sched::task::{Lane, Task};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Device {0} was cancelled")]
    Cancelled(u32),
}

/// How a submitted task is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Process on the caller's thread in the given lane.
    Sync(Lane),
    /// Queue on the normal queue for the device worker.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Processed,
    Queued,
    /// An equivalent task was already queued.
    Duplicate,
}

/// Device-level settings extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub page_size: u64,
    pub dma_read_latency_ns_per_page: u64,
    pub flash_write_latency_ns_per_page: u64,
    pub invalidate_at_future_value: bool,
    pub barrier_timeout: Duration,
    pub idle_poll: Duration,
}

impl DeviceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.timing.page_size.max(1),
            dma_read_latency_ns_per_page: config.timing.dma_read_latency_ns_per_page,
            flash_write_latency_ns_per_page: config.timing.flash_write_latency_ns_per_page,
            invalidate_at_future_value: config.edge_cache.invalidate_at_future_value,
            barrier_timeout: config.timing.barrier_timeout(),
            idle_poll: Duration::from_micros(config.timing.idle_poll_us),
        }
    }
}

/// Counters reported (and reset) by a flush.
#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub device: u32,
    pub edge: AccessStats,
    pub edge_hit_ratio: f64,
    pub vertex: AccessStats,
    pub costs: CostTotals,
    pub prefetch: PrefetchAccuracy,
    /// Tasks still queued when the flush arrived.
    pub dropped_tasks: usize,
}

/// Live view of a device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub device: u32,
    pub edge: AccessStats,
    pub edge_resident_bytes: u64,
    pub edge_capacity_bytes: u64,
    pub vertex: AccessStats,
    pub vertex_resident_bytes: u64,
    pub normal_queue: usize,
    pub future_queue: usize,
    pub costs: CostTotals,
    pub prefetch: PrefetchAccuracy,
}

/// Everything owned by one simulated device.
pub struct DeviceContext {
    id: u32,
    pub(crate) edge_cache: BlockCache,
    pub(crate) vertex_cache: PartitionCache,
    pub(crate) normal: TaskQueue,
    pub(crate) future: TaskQueue,
    pub(crate) cost: CostModel,
    pub(crate) prefetch: PrefetchTracker,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) settings: DeviceSettings,
    processor: Arc<dyn EdgeProcessor>,
    io: Arc<dyn IoTimer>,
    clock: Arc<dyn SimClock>,
    metrics: Option<Arc<SimMetrics>>,
    cancel: CancellationToken,
    /// Held for the length of one scheduling pass.
    step: Mutex<()>,
}

impl DeviceContext {
    pub fn new(
        id: u32,
        config: &Config,
        shared: Arc<SharedState>,
        processor: Arc<dyn EdgeProcessor>,
        io: Arc<dyn IoTimer>,
        clock: Arc<dyn SimClock>,
        cancel: CancellationToken,
    ) -> Self {
        let page_size = config.timing.page_size;
        info!(device = id, "Creating device context");
        Self {
            id,
            edge_cache: BlockCache::new(&config.edge_cache, page_size),
            vertex_cache: PartitionCache::new(&config.vertex_cache, page_size),
            normal: TaskQueue::new("normal"),
            future: TaskQueue::new("future"),
            cost: CostModel::new(config.timing.cpu_mcu_speed_ratio),
            prefetch: PrefetchTracker::new(page_size),
            shared,
            settings: DeviceSettings::from_config(config),
            processor,
            io,
            clock,
            metrics: None,
            cancel,
            step: Mutex::new(()),
        }
    }

    /// Attach a metrics registry.
    pub fn with_metrics(mut self, metrics: Arc<SimMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn edge_cache(&self) -> &BlockCache {
        &self.edge_cache
    }

    pub fn vertex_cache(&self) -> &PartitionCache {
        &self.vertex_cache
    }

    pub fn normal_queue(&self) -> &TaskQueue {
        &self.normal
    }

    pub fn future_queue(&self) -> &TaskQueue {
        &self.future
    }

    pub fn queue(&self, lane: Lane) -> &TaskQueue {
        match lane {
            Lane::Normal => &self.normal,
            Lane::Future => &self.future,
        }
    }

    pub fn cost(&self) -> &CostModel {
        &self.cost
    }

    pub fn prefetch(&self) -> &PrefetchTracker {
        &self.prefetch
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn clock(&self) -> &dyn SimClock {
        self.clock.as_ref()
    }

    pub fn metrics(&self) -> Option<&SimMetrics> {
        self.metrics.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Accept a host command for this device.
    ///
    /// The task's time budget is assigned by the I/O timer first.
    pub fn submit(&self, mut task: Task, mode: SubmitMode) -> Result<SubmitOutcome, DeviceError> {
        task.time_budget_ns = self
            .io
            .read_budget_ns(task.edge_block_offset, u64::from(task.edge_block_len));

        match mode {
            SubmitMode::Sync(lane) => {
                self.process_sync(&task, lane)?;
                Ok(SubmitOutcome::Processed)
            }
            SubmitMode::Async => {
                if self.normal.enqueue_unique(task)? {
                    self.publish_queue_depth();
                    debug!(
                        device = self.id,
                        row = task.row,
                        col = task.col,
                        iteration = task.iteration,
                        "Task queued"
                    );
                    Ok(SubmitOutcome::Queued)
                } else {
                    Ok(SubmitOutcome::Duplicate)
                }
            }
        }
    }

    /// Process a task on the calling thread: edge read, vertex read, compute.
    fn process_sync(&self, task: &Task, lane: Lane) -> Result<(), DeviceError> {
        let len = u64::from(task.edge_block_len);
        self.reserve_partition(task)?;

        let start = self.clock.now_ns();
        let not_resident = self.access_edge(task, AccessIntent::Demand)?;
        let ratio = CostModel::service_ratio(not_resident, len);
        self.park((task.time_budget_ns as f64 * ratio) as u64)?;
        self.cost.add_internal_io(self.clock.now_ns() - start);

        let start = self.clock.now_ns();
        let not_resident = self.access_partition(task)?;
        self.park_dma(not_resident)?;
        self.cost.add_external_io(self.clock.now_ns() - start);

        if self.compute(task, lane).is_none() {
            return Err(DeviceError::Cancelled(self.id));
        }
        if let Some(metrics) = self.metrics() {
            metrics.task_processed(self.id, lane);
        }
        debug!(device = self.id, row = task.row, col = task.col, iteration = task.iteration, %lane, "Processed synchronously");
        Ok(())
    }

    /// Demand or speculative edge-block access, mirrored into the metrics.
    pub fn access_edge(&self, task: &Task, intent: AccessIntent) -> Result<u64, CacheError> {
        let before = self.edge_cache.stats();
        let result = self.edge_cache.access(
            task.key(),
            u64::from(task.edge_block_len),
            intent,
            &self.shared.readiness,
        );
        if let Some(metrics) = self.metrics() {
            match &result {
                Ok(_) => {
                    let after = self.edge_cache.stats();
                    metrics.edge_pages(
                        self.id,
                        after.hit_pages - before.hit_pages,
                        after.total_pages - before.total_pages,
                    );
                }
                Err(_) => metrics.allocation_failure(self.id),
            }
        }
        result
    }

    /// Credit fetch bytes hidden behind compute as hits.
    pub(crate) fn credit_overlap(&self, bytes: u64) {
        let before = self.edge_cache.stats().hit_pages;
        self.edge_cache.credit_overlap(bytes);
        if let Some(metrics) = self.metrics() {
            metrics.edge_pages(self.id, self.edge_cache.stats().hit_pages - before, 0);
        }
    }

    /// Exclusive access between scheduling passes.
    pub(crate) fn step_guard(&self) -> MutexGuard<'_, ()> {
        self.step.lock()
    }

    /// Fail early if the task's source partition could not be admitted.
    pub fn reserve_partition(&self, task: &Task) -> Result<(), CacheError> {
        let result = self
            .vertex_cache
            .reserve(PartitionKey::new(task.row, task.iteration));
        if result.is_err() {
            if let Some(metrics) = self.metrics() {
                metrics.allocation_failure(self.id);
            }
        }
        result
    }

    /// Access the task's source partition and charge the write-back of
    /// whatever it evicted. Returns the bytes that were not resident.
    pub fn access_partition(&self, task: &Task) -> Result<u64, DeviceError> {
        let key = PartitionKey::new(task.row, task.iteration);
        let access = self.vertex_cache.access(key, task.partition_bytes())?;
        if access.evicted > 0 {
            let write_ns =
                self.settings.flash_write_latency_ns_per_page * access.evicted / self.settings.page_size;
            self.park(write_ns)?;
        }
        Ok(access.not_resident)
    }

    /// Park for the DMA read of `not_resident` vertex bytes.
    pub fn park_dma(&self, not_resident: u64) -> Result<(), DeviceError> {
        self.park(self.settings.dma_read_latency_ns_per_page * not_resident / self.settings.page_size)
    }

    /// Park the device for `ns` of simulated time.
    pub fn park(&self, ns: u64) -> Result<(), DeviceError> {
        if self.clock.park_for(ns, &self.cancel) {
            Ok(())
        } else {
            Err(DeviceError::Cancelled(self.id))
        }
    }

    /// Run the edge processor for `lane` and stretch it to MCU speed.
    ///
    /// Returns the charged compute time, or `None` if cancelled meanwhile.
    pub fn compute(&self, task: &Task, lane: Lane) -> Option<u64> {
        let (dst, src): (Region, Region) = lane_regions(lane);
        let start = self.clock.now_ns();
        self.processor
            .process(task, dst, src, &self.shared.buffers, self.shared.done(lane));
        let elapsed = self.clock.now_ns() - start;

        if !self.clock.park_for(self.cost.mcu_extra_ns(elapsed), &self.cancel) {
            return None;
        }
        let charged = self.clock.now_ns() - start;
        self.cost.add_compute(charged);
        Some(charged)
    }

    pub(crate) fn publish_queue_depth(&self) {
        if let Some(metrics) = self.metrics() {
            metrics.set_queue_depth(self.id, self.normal.name(), self.normal.len());
            metrics.set_queue_depth(self.id, self.future.name(), self.future.len());
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            device: self.id,
            edge: self.edge_cache.stats(),
            edge_resident_bytes: self.edge_cache.size(),
            edge_capacity_bytes: self.edge_cache.capacity(),
            vertex: self.vertex_cache.stats(),
            vertex_resident_bytes: self.vertex_cache.size(),
            normal_queue: self.normal.len(),
            future_queue: self.future.len(),
            costs: self.cost.totals(),
            prefetch: self.prefetch.accuracy(),
        }
    }

    /// Report the run's counters, publish them to the shared window and reset
    /// caches, queues and counters.
    ///
    /// Waits for an in-flight scheduling pass to finish first, so that pass
    /// cannot queue follow-up work into the flushed device.
    pub fn flush(&self) -> FlushReport {
        let _step = self.step_guard();
        let edge = self.edge_cache.stats();
        let report = FlushReport {
            device: self.id,
            edge,
            edge_hit_ratio: edge.hit_ratio(),
            vertex: self.vertex_cache.stats(),
            costs: self.cost.totals(),
            prefetch: self.prefetch.accuracy(),
            dropped_tasks: self.normal.len() + self.future.len(),
        };

        info!(
            device = self.id,
            edge_hit = report.edge.hit_pages,
            edge_total = report.edge.total_pages,
            vertex_hit = report.vertex.hit_pages,
            vertex_total = report.vertex.total_pages,
            compute_ms = report.costs.compute_ms,
            internal_io_ms = report.costs.internal_io_ms,
            external_io_ms = report.costs.external_io_ms,
            "Device flushed"
        );
        let total = report.prefetch.total();
        info!(
            device = self.id,
            issued_blocks = total.issued_blocks,
            hit_blocks = total.hit_blocks,
            issued_pages = total.issued_pages,
            hit_pages = total.hit_pages,
            "Read-ahead accuracy"
        );
        if report.dropped_tasks > 0 {
            warn!(device = self.id, dropped = report.dropped_tasks, "Flush dropped queued tasks");
        }

        self.publish_report(&report);

        self.edge_cache.clear();
        self.vertex_cache.clear();
        self.normal.clear();
        self.future.clear();
        self.cost.clear();
        self.prefetch.clear();
        self.publish_queue_depth();

        report
    }

    /// Slot `device + num_devices * k` of the shared next-region window holds
    /// the k-th summary value.
    fn publish_report(&self, report: &FlushReport) {
        let stride = self.shared.readiness.num_devices() as usize;
        let values = [
            report.edge_hit_ratio as f32,
            report.costs.compute_ms as f32,
            report.costs.internal_io_ms as f32,
            report.costs.external_io_ms as f32,
        ];
        for (k, value) in values.into_iter().enumerate() {
            self.shared
                .buffers
                .store(Region::Next, self.id as usize + stride * k, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::compute::{InMemoryGraph, LinearIoModel};
    use crate::sched::clock::VirtualClock;
    use crate::sched::task::tests::task;

    fn context(config: &Config) -> DeviceContext {
        let shared = Arc::new(SharedState::new(&config.topology));
        DeviceContext::new(
            0,
            config,
            shared,
            Arc::new(InMemoryGraph::default()),
            Arc::new(LinearIoModel::new(1_000, config.timing.page_size)),
            Arc::new(VirtualClock::default()),
            CancellationToken::new(),
        )
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.topology.num_devices = 1;
        config.topology.num_partitions = 4;
        config.topology.num_vertices = 1024;
        config.edge_cache.capacity_bytes = 64 * 1024;
        config
    }

    #[test]
    fn test_async_submit_deduplicates() {
        let ctx = context(&small_config());
        assert_eq!(ctx.submit(task(0, 1, 0), SubmitMode::Async).unwrap(), SubmitOutcome::Queued);
        assert_eq!(ctx.submit(task(0, 1, 0), SubmitMode::Async).unwrap(), SubmitOutcome::Duplicate);
        assert_eq!(ctx.normal_queue().len(), 1);
        // Budget assigned from the I/O timer: one 4 KiB page.
        assert_eq!(ctx.normal_queue().peek_front().map(|t| t.time_budget_ns), Some(1_000));
    }

    #[test]
    fn test_sync_submit_charges_time() {
        let ctx = context(&small_config());
        ctx.submit(task(1, 2, 0), SubmitMode::Sync(Lane::Normal)).unwrap();
        assert!(ctx.shared().done_normal.is_done(0, 1, 2));
        assert_eq!(ctx.edge_cache().stats().total_pages, 1);
        assert_eq!(ctx.vertex_cache().stats().total_pages, 0);
        assert!(ctx.normal_queue().is_empty());

        // Second run hits the edge cache.
        ctx.submit(task(1, 2, 0), SubmitMode::Sync(Lane::Future)).unwrap();
        assert_eq!(ctx.edge_cache().stats().hit_pages, 1);
        assert!(ctx.shared().done_future.is_done(0, 1, 2));
    }

    #[test]
    fn test_flush_reports_and_resets() {
        let ctx = context(&small_config());
        ctx.submit(task(0, 0, 0), SubmitMode::Sync(Lane::Normal)).unwrap();
        ctx.submit(task(0, 0, 0), SubmitMode::Sync(Lane::Normal)).unwrap();
        ctx.submit(task(3, 3, 0), SubmitMode::Async).unwrap();

        let report = ctx.flush();
        assert_eq!(report.edge.total_pages, 2);
        assert_eq!(report.edge.hit_pages, 1);
        assert_eq!(report.edge_hit_ratio, 0.5);
        assert_eq!(report.dropped_tasks, 1);

        assert!(ctx.edge_cache().is_empty());
        assert!(ctx.normal_queue().is_empty());
        assert_eq!(ctx.stats().edge, AccessStats::default());
        assert_eq!(ctx.shared().buffers.load(Region::Next, 0), 0.5);
    }

    #[test]
    fn test_cancelled_sync_submit() {
        let ctx = context(&small_config());
        ctx.cancel_token().cancel();
        let err = ctx.submit(task(0, 0, 0), SubmitMode::Sync(Lane::Normal));
        assert!(matches!(err, Err(DeviceError::Cancelled(0))));
    }
}
