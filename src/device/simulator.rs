//! Device workers.
//!
//! A [`Simulator`] builds one [`DeviceContext`] per configured device over a
//! single [`SharedState`], then runs each device's [`Scheduler`] on its own OS
//! thread. Workers keep polling while their queues are empty until the
//! simulator is closed; cancellation stops them mid-wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::compute::{EdgeProcessor, InMemoryGraph, IoTimer, LinearIoModel};
use crate::device::context::{DeviceContext, DeviceError};
use crate::device::shared::SharedState;
use crate::metrics::SimMetrics;
use crate::sched::clock::{MonotonicClock, SimClock};
use crate::sched::scheduler::{Scheduler, StepOutcome};

#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error("Unknown device {0}")]
    UnknownDevice(u32),

    #[error("Failed to spawn device worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct Simulator {
    shared: Arc<SharedState>,
    devices: Vec<Arc<DeviceContext>>,
    metrics: Arc<SimMetrics>,
    clock: Arc<dyn SimClock>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<usize>>>,
}

impl Simulator {
    pub fn new(
        config: &Config,
        processor: Arc<dyn EdgeProcessor>,
        io: Arc<dyn IoTimer>,
        clock: Arc<dyn SimClock>,
    ) -> Result<Self, SimulatorError> {
        let shared = Arc::new(SharedState::new(&config.topology));
        let metrics = Arc::new(SimMetrics::new()?);
        let cancel = CancellationToken::new();

        let devices = (0..config.topology.num_devices)
            .map(|id| {
                Arc::new(
                    DeviceContext::new(
                        id,
                        config,
                        shared.clone(),
                        processor.clone(),
                        io.clone(),
                        clock.clone(),
                        cancel.child_token(),
                    )
                    .with_metrics(metrics.clone()),
                )
            })
            .collect();

        info!(
            devices = config.topology.num_devices,
            partitions = config.topology.num_partitions,
            vertices = config.topology.num_vertices,
            edge_capacity = config.edge_cache.capacity_bytes,
            policy = ?config.edge_cache.policy,
            "Simulator created"
        );

        Ok(Self {
            shared,
            devices,
            metrics,
            clock,
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Simulator with an empty in-memory graph, linear flash timing and wall time.
    pub fn with_defaults(config: &Config) -> Result<Self, SimulatorError> {
        let io = LinearIoModel::new(config.timing.flash_read_latency_ns_per_page, config.timing.page_size);
        Self::new(
            config,
            Arc::new(InMemoryGraph::default()),
            Arc::new(io),
            Arc::new(MonotonicClock::new()),
        )
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, id: u32) -> Result<&Arc<DeviceContext>, SimulatorError> {
        self.devices
            .get(id as usize)
            .ok_or(SimulatorError::UnknownDevice(id))
    }

    pub fn devices(&self) -> &[Arc<DeviceContext>] {
        &self.devices
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn metrics(&self) -> &Arc<SimMetrics> {
        &self.metrics
    }

    /// Mark a partition's aggregation as complete (or not).
    pub fn set_ready(&self, partition: u32, ready: bool) -> bool {
        self.shared.readiness.set_ready(partition, ready)
    }

    /// Release a device waiting at the end-of-iteration barrier.
    pub fn acknowledge_barrier(&self, device: u32) -> bool {
        self.shared.readiness.clear_barrier(device)
    }

    /// Spawn one worker thread per device. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), SimulatorError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for ctx in &self.devices {
            let ctx = ctx.clone();
            let closed = self.closed.clone();
            let handle = thread::Builder::new()
                .name(format!("csd-device-{}", ctx.id()))
                .spawn(move || run_worker(ctx, &closed))?;
            workers.push(handle);
        }
        info!(workers = workers.len(), "Device workers started");
        Ok(())
    }

    /// Let workers exit once their queues are drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Wait for every worker to exit. Returns the number of processed tasks.
    pub fn join(&self) -> usize {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let mut processed = 0;
        for handle in handles {
            match handle.join() {
                Ok(count) => processed += count,
                Err(_) => warn!("Device worker panicked"),
            }
        }
        processed
    }

    /// Cancel every in-flight wait and join the workers.
    pub fn shutdown(&self) -> usize {
        info!("Shutting down device workers");
        self.close();
        self.cancel.cancel();
        self.join()
    }

    pub fn clock(&self) -> &dyn SimClock {
        self.clock.as_ref()
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(ctx: Arc<DeviceContext>, closed: &AtomicBool) -> usize {
    let device = ctx.id();
    let idle_poll = ctx.settings().idle_poll;
    let scheduler = Scheduler::new(ctx);
    let mut processed = 0;
    debug!(device, "Device worker running");

    loop {
        match scheduler.step() {
            StepOutcome::Executed(_) => processed += 1,
            StepOutcome::Barrier => {}
            StepOutcome::Retried(_) | StepOutcome::Stalled => scheduler.context().clock().relax(),
            StepOutcome::Idle => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(idle_poll);
            }
            StepOutcome::Cancelled => break,
        }
    }

    debug!(device, processed, "Device worker stopped");
    processed
}
