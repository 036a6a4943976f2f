//! Task scheduling.
//!
//! - [`task`]: Task descriptor and its packed wire record
//! - [`queue`]: Normal and future task queues
//! - [`scheduler`]: Dual-queue scheduler with the end-of-iteration barrier
//! - [`cost`]: Compute and I/O time ledger
//! - [`clock`]: Simulated time and bounded waits

pub mod clock;
pub mod cost;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use clock::{MonotonicClock, SimClock, VirtualClock};
pub use cost::{CostModel, CostTotals};
pub use queue::{QueueError, TaskQueue};
pub use scheduler::{Scheduler, SchedulerState, StepOutcome};
pub use task::{Lane, RowOverlap, Task, TaskRecord, WireError};
