//! csd-sim: on-device cache and scheduler emulation for computational storage.
//!
//! Each simulated device processes edge blocks of a partitioned graph for an
//! iterative vertex aggregation:
//!   host submits tasks -> device scheduler (normal/future queues)
//!     -> edge-block cache + vertex-partition cache -> edge processor
//!
//! Devices coordinate through shared readiness flags and an end-of-iteration
//! barrier. A small HTTP control plane accepts tasks and aggregator signals.

pub mod cache;
pub mod config;
pub mod device;
pub mod metrics;
pub mod sched;
pub mod server;
