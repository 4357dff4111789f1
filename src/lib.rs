//! Area speed advisor simulation.
//!
//! Vehicles driven by a mobility trace are mapped onto a fixed pool of network
//! endpoints. Each vehicle beacons its position to an infrastructure server,
//! which advises a new speed limit whenever the vehicle crosses between the
//! inner and the outer zone of the area. A supervisor measures reception ratio
//! and latency of every message.

pub mod common;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod simulation;
pub mod supervisor;
