//! HTTP control plane for the simulator.
//!
//! - [`control_api`]: Request/response types and route handlers

pub mod control_api;
