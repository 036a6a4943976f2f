//! Simulated computational storage devices.
//!
//! - [`shared`]: Readiness flags, vertex buffers and completion maps shared across devices
//! - [`compute`]: Edge processing and I/O timing delegates
//! - [`context`]: Per-device caches, queues and counters
//! - [`simulator`]: Device worker threads

pub mod compute;
pub mod context;
pub mod shared;
pub mod simulator;

pub use compute::{EdgeProcessor, InMemoryGraph, IoTimer, LinearIoModel};
pub use context::{DeviceContext, DeviceError, FlushReport, SubmitMode, SubmitOutcome};
pub use shared::{Region, SharedState};
pub use simulator::{Simulator, SimulatorError};
