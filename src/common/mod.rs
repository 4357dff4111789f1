//! Scenario description shared by the simulation and the CLI.
//!
//! - `config`: TOML scenario parameters (area, speed limits, beacons, channel...)
//! - `geometry`: points, rectangles and zone classification
//! - `trace`: mobility ticks consumed from the mobility engine

pub mod config;
pub mod geometry;
pub mod trace;

pub use config::{ConfigError, ScenarioConfig};
pub use geometry::{AreaPartition, PARKED_POSITION, Point, RectPos, Zone};
pub use trace::{MobilitySource, MobilityTick, MobilityTrace, TraceError, VehicleId, VehiclePosition};
