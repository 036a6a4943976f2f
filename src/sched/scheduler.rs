//! Dual-queue scheduler of one device.
//!
//! Every device alternates between two kinds of work:
//! - normal tasks compute this iteration's values from the previous ones
//! - future tasks compute next iteration's values as soon as the source row
//!   has been aggregated upstream, ahead of the iteration barrier
//!
//! A normal task that can also seed the next iteration moves into the future
//! queue with its iteration advanced. When the future queue's front is the
//! closing marker of the half-iteration, the device waits for the last
//! partition, swaps its queues, meets the other devices at the barrier and
//! rotates its vertex window.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::edge_cache::CacheError;
use crate::cache::entry::AccessIntent;
use crate::device::context::{DeviceContext, DeviceError};
use crate::metrics::BarrierPhase;
use crate::sched::clock::{wait_until, BarrierOutcome};
use crate::sched::cost::CostModel;
use crate::sched::task::{Lane, Task};

/// Where the scheduler currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    DrainFuture = 1,
    DrainNormal = 2,
    EndOfIterBarrier = 3,
    Swap = 4,
    Done = 5,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::DrainFuture,
            2 => SchedulerState::DrainNormal,
            3 => SchedulerState::EndOfIterBarrier,
            4 => SchedulerState::Swap,
            5 => SchedulerState::Done,
            _ => SchedulerState::Idle,
        }
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A task was processed in the given lane.
    Executed(Lane),
    /// The end-of-iteration barrier completed (or timed out) and queues were swapped.
    Barrier,
    /// The task could not get a cache slot and was put back.
    Retried(Lane),
    /// Future work exists but none is ready and the normal queue is empty.
    Stalled,
    /// Both queues are empty.
    Idle,
    Cancelled,
}

/// Intent of a read-ahead of `next` issued while processing `current`.
///
/// Pending future work is plain read-ahead. Normal work read from the future
/// lane, or work of a later iteration, is the first to be evicted again.
pub fn prefetch_intent(current_lane: Lane, current: &Task, next_lane: Lane, next: &Task) -> AccessIntent {
    match next_lane {
        Lane::Future => AccessIntent::ReadAhead,
        Lane::Normal if current_lane == Lane::Future => AccessIntent::ReadAheadNormal,
        Lane::Normal if next.iteration > current.iteration => AccessIntent::ReadAheadNextIteration,
        Lane::Normal => AccessIntent::ReadAhead,
    }
}

/// Whether a processed block leaves the edge cache when invalidation at
/// future value is enabled.
fn invalidates_block(lane: Lane, task: &Task) -> bool {
    match lane {
        Lane::Future => true,
        // Lower triangle of the first iteration is never reused by the future lane.
        Lane::Normal => task.iteration == 0 && task.row > task.col,
    }
}

pub struct Scheduler {
    ctx: Arc<DeviceContext>,
    state: AtomicU8,
}

impl Scheduler {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            state: AtomicU8::new(SchedulerState::Idle as u8),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run passes until both queues are empty or the device is cancelled.
    ///
    /// Returns the number of processed tasks.
    pub fn drain(&self) -> usize {
        let mut executed = 0;
        loop {
            match self.step() {
                StepOutcome::Executed(_) => executed += 1,
                StepOutcome::Barrier => {}
                StepOutcome::Retried(_) | StepOutcome::Stalled => self.ctx.clock().relax(),
                StepOutcome::Idle | StepOutcome::Cancelled => return executed,
            }
        }
    }

    /// One scheduling pass.
    pub fn step(&self) -> StepOutcome {
        let ctx = &*self.ctx;
        if ctx.cancel_token().is_cancelled() {
            self.set_state(SchedulerState::Done);
            return StepOutcome::Cancelled;
        }
        let _step = ctx.step_guard();
        if ctx.normal.is_empty() && ctx.future.is_empty() {
            self.set_state(SchedulerState::Idle);
            return StepOutcome::Idle;
        }

        let signal = &ctx.shared.readiness;
        let ready = |row: u32| signal.is_ready(row);

        if let Some(front) = ctx.future.peek_front() {
            if front.is_closing() {
                return self.end_of_iteration(front);
            }

            let mut candidate = front;
            if front.row_overlap.is_active() {
                if let Some(pulled) = ctx.future.find_next(ready, front.row_overlap, false) {
                    candidate = pulled;
                }
            }

            if signal.is_ready(candidate.row) {
                if let Some(task) = ctx.future.find_next(ready, front.row_overlap, true) {
                    return self.execute(task, Lane::Future);
                }
            }
        }

        match ctx.normal.dequeue() {
            Some(task) => self.execute(task, Lane::Normal),
            None => StepOutcome::Stalled,
        }
    }

    /// Barrier and queue swap triggered by the closing marker `front`.
    fn end_of_iteration(&self, front: Task) -> StepOutcome {
        let ctx = &*self.ctx;
        let device = ctx.id();
        let signal = &ctx.shared.readiness;
        let timeout = ctx.settings.barrier_timeout;

        self.set_state(SchedulerState::EndOfIterBarrier);
        match wait_until(ctx.clock(), timeout, ctx.cancel_token(), || signal.is_ready(front.row)) {
            BarrierOutcome::Reached => {}
            BarrierOutcome::TimedOut => self.barrier_timed_out(&front, BarrierPhase::Aggregation),
            BarrierOutcome::Cancelled => return self.cancelled(),
        }

        ctx.future.dequeue();
        self.set_state(SchedulerState::Swap);
        ctx.normal.swap_with(&ctx.future);

        signal.announce_barrier(device);
        match wait_until(ctx.clock(), timeout, ctx.cancel_token(), || !signal.barrier_pending(device)) {
            BarrierOutcome::Reached => {}
            BarrierOutcome::TimedOut => self.barrier_timed_out(&front, BarrierPhase::Acknowledge),
            BarrierOutcome::Cancelled => return self.cancelled(),
        }

        ctx.shared.buffers.rotate_device_window(device);
        ctx.publish_queue_depth();

        info!(
            device,
            iteration = front.iteration,
            normal = ctx.normal.len(),
            future = ctx.future.len(),
            "End of iteration: queues swapped"
        );
        StepOutcome::Barrier
    }

    fn barrier_timed_out(&self, front: &Task, phase: BarrierPhase) {
        let device = self.ctx.id();
        warn!(
            device,
            row = front.row,
            iteration = front.iteration,
            phase = phase.as_str(),
            "Timeout waiting at end-of-iteration barrier, proceeding"
        );
        if let Some(metrics) = self.ctx.metrics() {
            metrics.barrier_timeout(device, phase);
        }
    }

    fn cancelled(&self) -> StepOutcome {
        self.set_state(SchedulerState::Done);
        StepOutcome::Cancelled
    }

    /// Process one task taken from `lane`'s queue.
    fn execute(&self, task: Task, lane: Lane) -> StepOutcome {
        let ctx = &*self.ctx;
        let device = ctx.id();
        self.set_state(match lane {
            Lane::Future => SchedulerState::DrainFuture,
            Lane::Normal => SchedulerState::DrainNormal,
        });

        let len = u64::from(task.edge_block_len);
        let resident_before = ctx.edge_cache.resident_size(task.key()).unwrap_or(0);

        if let Err(err) = ctx.reserve_partition(&task) {
            return self.retry(task, lane, "Vertex partition", &err);
        }

        let io_start = ctx.clock().now_ns();
        let not_resident = match ctx.access_edge(&task, AccessIntent::Demand) {
            Ok(bytes) => bytes,
            Err(err) => return self.retry(task, lane, "Edge block", &err),
        };
        ctx.cost.add_internal_io(ctx.clock().now_ns() - io_start);
        ctx.prefetch.observe(task.key(), task.iteration, resident_before);

        if ctx.settings.invalidate_at_future_value && invalidates_block(lane, &task) {
            ctx.edge_cache.invalidate(task.key());
        }

        let Some(proc_ns) = ctx.compute(&task, lane) else {
            return self.cancelled();
        };

        let io_start = ctx.clock().now_ns();
        let mut ratio = CostModel::service_ratio(not_resident, len);
        if task.prefetch_level >= 1 {
            let pipeline = CostModel::pipeline(proc_ns, task.time_budget_ns, ratio, len, not_resident);
            ctx.credit_overlap(pipeline.overlap_bytes);
            ratio = pipeline.remaining_ratio;

            if task.prefetch_level >= 2 {
                ctx.prefetch.clear_last();
                if pipeline.prefetch_budget_ns > 0 {
                    self.read_ahead(&task, lane, pipeline.prefetch_budget_ns);
                }
            }
        }

        if ctx.park((task.time_budget_ns as f64 * ratio) as u64).is_err() {
            return self.cancelled();
        }
        ctx.cost.add_internal_io(ctx.clock().now_ns() - io_start);

        let ext_start = ctx.clock().now_ns();
        let partition_miss = match ctx.access_partition(&task) {
            Ok(bytes) => bytes,
            Err(DeviceError::Cancelled(_)) => return self.cancelled(),
            Err(err) => {
                warn!(device, row = task.row, error = %err, "Vertex partition access failed");
                if let Some(metrics) = ctx.metrics() {
                    metrics.allocation_failure(device);
                }
                task.partition_bytes()
            }
        };
        if lane == Lane::Normal && ctx.park_dma(partition_miss).is_err() {
            return self.cancelled();
        }
        ctx.cost.add_external_io(ctx.clock().now_ns() - ext_start);

        match lane {
            Lane::Future => self.after_future(&task),
            Lane::Normal => self.after_normal(&task),
        }

        if let Some(metrics) = ctx.metrics() {
            metrics.task_processed(device, lane);
        }
        ctx.publish_queue_depth();
        debug!(
            device,
            row = task.row,
            col = task.col,
            iteration = task.iteration,
            %lane,
            not_resident,
            proc_ns,
            "Processed edge block"
        );
        StepOutcome::Executed(lane)
    }

    /// Put `task` back at the front of its queue for the next pass.
    fn retry(&self, task: Task, lane: Lane, what: &str, err: &CacheError) -> StepOutcome {
        let device = self.ctx.id();
        warn!(device, row = task.row, col = task.col, %lane, error = %err, "{what} allocation failed, retrying task");
        if let Err(err) = self.ctx.queue(lane).requeue_front(task) {
            warn!(device, row = task.row, col = task.col, %lane, error = %err, "Task dropped");
        }
        StepOutcome::Retried(lane)
    }

    /// Speculatively fill the cache for the next likely task within `budget_ns`.
    fn read_ahead(&self, current: &Task, lane: Lane, budget_ns: i64) {
        let ctx = &*self.ctx;
        let signal = &ctx.shared.readiness;

        let (next, next_lane) = match ctx
            .future
            .find_next(|row| signal.is_ready(row), current.row_overlap, false)
        {
            Some(next) => (next, Lane::Future),
            None => match ctx.normal.peek_front() {
                Some(next) => (next, Lane::Normal),
                None => return,
            },
        };

        let len = u64::from(next.edge_block_len);
        let resident = ctx.edge_cache.resident_size(next.key()).unwrap_or(0);
        let mut leftover = budget_ns;
        let Some(target) = CostModel::prefetch_fill(&mut leftover, len, resident, next.time_budget_ns) else {
            return;
        };

        let intent = prefetch_intent(lane, current, next_lane, &next);
        let mut request = next;
        request.edge_block_len = u32::try_from(target).unwrap_or(u32::MAX);
        match ctx.access_edge(&request, intent) {
            Ok(_) => {
                let now_resident = ctx.edge_cache.resident_size(next.key()).unwrap_or(0);
                let tier = intent.admission_tag();
                ctx.prefetch
                    .record_issue(next.key(), next.iteration, tier, now_resident.saturating_sub(resident));
                if let Some(metrics) = ctx.metrics() {
                    metrics.read_ahead(ctx.id(), tier);
                }
            }
            Err(err) => {
                debug!(device = ctx.id(), key = %next.key(), error = %err, "Read-ahead skipped");
            }
        }
    }

    /// Follow-up of a future-lane task.
    fn after_future(&self, task: &Task) {
        let last = task.num_partitions.saturating_sub(1);
        // Even iterations close on row 0 once the last row's column 0 is done.
        if task.iteration % 2 == 0 && task.row == last && task.col == 0 {
            self.enqueue_future(task.sentinel(0, 0, task.iteration));
        }
    }

    /// Follow-up of a normal-lane task: seed the next iteration, or close the
    /// final one.
    fn after_normal(&self, task: &Task) {
        let mut next = *task;
        if task.advances_to_future() {
            next.iteration += 1;
            self.enqueue_future(next);
        }

        if next.iteration.wrapping_add(1) == next.num_iterations {
            let last = next.num_partitions.saturating_sub(1);
            if next.iteration % 2 == 0 && next.row == last && next.col == last {
                self.enqueue_future(next.sentinel(last, last, next.iteration + 1));
            } else if next.iteration % 2 == 1 && next.row == last && next.col == 0 {
                self.enqueue_future(next.sentinel(0, 0, next.iteration + 1));
            }
        }
    }

    fn enqueue_future(&self, task: Task) {
        if let Err(err) = self.ctx.future.enqueue(task) {
            warn!(device = self.ctx.id(), row = task.row, col = task.col, error = %err, "Future task dropped");
            if let Some(metrics) = self.ctx.metrics() {
                metrics.allocation_failure(self.ctx.id());
            }
        }
    }
}
