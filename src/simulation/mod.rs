//! Scenario execution.
//!
//! ## Module Organization
//!
//! - `channel`: seeded lossy channel between vehicles and the infrastructure
//! - `runner`: event loop wiring pool, protocol and supervisor over virtual time
//! - `report`: JSON summary, cumulative CSV and per-vehicle CSV output

pub mod channel;
pub mod report;
pub mod runner;

pub use channel::{ChannelStats, Destination, LossyChannel};
pub use report::{ReportError, append_cumulative_csv, write_summary_json, write_vehicle_csv};
pub use runner::{RunSummary, Simulation, SimulationError};
