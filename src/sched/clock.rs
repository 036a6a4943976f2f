//! Simulated time.
//!
//! Device I/O and compute latencies are emulated by parking the worker until a
//! target timestamp. The [`SimClock`] capability hides where time comes from:
//! - [`MonotonicClock`]: wall time, sub-millisecond parks by spinning/yielding
//! - [`VirtualClock`]: manually advanced time for deterministic tests
//!
//! Every park and bounded wait checks a [`CancellationToken`] and returns early
//! once it is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Source of simulated time.
pub trait SimClock: Send + Sync {
    /// Nanoseconds since the clock's origin.
    fn now_ns(&self) -> u64;

    /// One polling step of a busy wait.
    fn relax(&self);

    /// Block until `target_ns`. Returns `false` if cancelled first.
    fn park_until(&self, target_ns: u64, cancel: &CancellationToken) -> bool;

    /// Block for `duration_ns` from now. Returns `false` if cancelled first.
    fn park_for(&self, duration_ns: u64, cancel: &CancellationToken) -> bool {
        if duration_ns == 0 {
            return !cancel.is_cancelled();
        }
        let target = self.now_ns().saturating_add(duration_ns);
        self.park_until(target, cancel)
    }
}

/// Result of a bounded wait on a shared flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    Reached,
    TimedOut,
    Cancelled,
}

/// Poll `done` until it holds, `timeout` elapses on `clock`, or `cancel` fires.
pub fn wait_until<F>(
    clock: &dyn SimClock,
    timeout: Duration,
    cancel: &CancellationToken,
    mut done: F,
) -> BarrierOutcome
where
    F: FnMut() -> bool,
{
    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    let deadline = clock.now_ns().saturating_add(timeout_ns);
    loop {
        if cancel.is_cancelled() {
            return BarrierOutcome::Cancelled;
        }
        if done() {
            return BarrierOutcome::Reached;
        }
        if clock.now_ns() >= deadline {
            return BarrierOutcome::TimedOut;
        }
        clock.relax();
    }
}

/// Wall-clock time from `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Parks longer than this yield the thread between polls instead of spinning.
    const SPIN_THRESHOLD_NS: u64 = 50_000;

    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn relax(&self) {
        std::thread::yield_now();
    }

    fn park_until(&self, target_ns: u64, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = self.now_ns();
            if now >= target_ns {
                return true;
            }
            if target_ns - now > Self::SPIN_THRESHOLD_NS {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Manually driven clock.
///
/// Parks complete instantly by jumping time forward; each `relax` advances
/// time by one tick so bounded waits terminate.
#[derive(Debug)]
pub struct VirtualClock {
    now: AtomicU64,
    tick_ns: u64,
}

impl VirtualClock {
    pub fn new(tick_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            tick_ns: tick_ns.max(1),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl SimClock for VirtualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn relax(&self) {
        self.advance(self.tick_ns);
        std::thread::yield_now();
    }

    fn park_until(&self, target_ns: u64, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.now.fetch_max(target_ns, Ordering::SeqCst);
        true
    }
}
