//! Prometheus counters for the simulated devices.
//!
//! Each [`SimMetrics`] owns its own registry so several simulators (and tests)
//! can coexist in one process.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::entry::AdmissionTag;
use crate::sched::task::Lane;

/// Which of the two end-of-iteration waits timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    /// Waiting for the last partition's aggregation.
    Aggregation,
    /// Waiting for the aggregator to acknowledge this device's arrival.
    Acknowledge,
}

impl BarrierPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BarrierPhase::Aggregation => "aggregation",
            BarrierPhase::Acknowledge => "acknowledge",
        }
    }
}

pub struct SimMetrics {
    registry: Registry,
    tasks_processed: IntCounterVec,
    barrier_timeouts: IntCounterVec,
    read_aheads: IntCounterVec,
    allocation_failures: IntCounterVec,
    edge_hit_pages: IntCounterVec,
    edge_total_pages: IntCounterVec,
    queue_depth: IntGaugeVec,
}

impl SimMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("csd_sim".to_string()), None)?;

        let tasks_processed = IntCounterVec::new(
            Opts::new("tasks_processed_total", "Edge blocks processed"),
            &["device", "lane"],
        )?;
        let barrier_timeouts = IntCounterVec::new(
            Opts::new("barrier_timeouts_total", "End-of-iteration waits that timed out"),
            &["device", "phase"],
        )?;
        let read_aheads = IntCounterVec::new(
            Opts::new("read_aheads_total", "Speculative edge-block fills issued"),
            &["device", "tier"],
        )?;
        let allocation_failures = IntCounterVec::new(
            Opts::new("allocation_failures_total", "Cache or queue slots that could not be allocated"),
            &["device"],
        )?;
        let edge_hit_pages = IntCounterVec::new(
            Opts::new("edge_hit_pages_total", "Edge-cache pages served from DRAM"),
            &["device"],
        )?;
        let edge_total_pages = IntCounterVec::new(
            Opts::new("edge_total_pages_total", "Edge-cache pages demanded"),
            &["device"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Tasks waiting per queue"),
            &["device", "queue"],
        )?;

        registry.register(Box::new(tasks_processed.clone()))?;
        registry.register(Box::new(barrier_timeouts.clone()))?;
        registry.register(Box::new(read_aheads.clone()))?;
        registry.register(Box::new(allocation_failures.clone()))?;
        registry.register(Box::new(edge_hit_pages.clone()))?;
        registry.register(Box::new(edge_total_pages.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            tasks_processed,
            barrier_timeouts,
            read_aheads,
            allocation_failures,
            edge_hit_pages,
            edge_total_pages,
            queue_depth,
        })
    }

    pub fn task_processed(&self, device: u32, lane: Lane) {
        self.tasks_processed
            .with_label_values(&[device.to_string().as_str(), lane.as_str()])
            .inc();
    }

    pub fn barrier_timeout(&self, device: u32, phase: BarrierPhase) {
        self.barrier_timeouts
            .with_label_values(&[device.to_string().as_str(), phase.as_str()])
            .inc();
    }

    pub fn read_ahead(&self, device: u32, tier: AdmissionTag) {
        self.read_aheads
            .with_label_values(&[device.to_string().as_str(), tier.as_str()])
            .inc();
    }

    pub fn allocation_failure(&self, device: u32) {
        self.allocation_failures
            .with_label_values(&[device.to_string().as_str()])
            .inc();
    }

    /// Add the demand-page deltas of one edge-cache access.
    pub fn edge_pages(&self, device: u32, hit: u64, total: u64) {
        let device = device.to_string();
        self.edge_hit_pages
            .with_label_values(&[device.as_str()])
            .inc_by(hit);
        self.edge_total_pages
            .with_label_values(&[device.as_str()])
            .inc_by(total);
    }

    pub fn set_queue_depth(&self, device: u32, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[device.to_string().as_str(), queue])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Current value of the processed-task counter.
    pub fn tasks_processed(&self, device: u32, lane: Lane) -> u64 {
        self.tasks_processed
            .with_label_values(&[device.to_string().as_str(), lane.as_str()])
            .get()
    }

    pub fn barrier_timeouts(&self, device: u32, phase: BarrierPhase) -> u64 {
        self.barrier_timeouts
            .with_label_values(&[device.to_string().as_str(), phase.as_str()])
            .get()
    }

    /// Text exposition format of every metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
