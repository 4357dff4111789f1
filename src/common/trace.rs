//! Mobility trace loading.
//!
//! The mobility engine is consumed as a sequence of synchronization ticks,
//! each listing the vehicles that appeared, the ones that left and the new
//! positions of the ones still moving. [`MobilitySource`] is the only thing the
//! simulation depends on; [`MobilityTrace`] replays such ticks from a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;

use super::geometry::Point;

/// Identity assigned to a vehicle by the mobility engine.
pub type VehicleId = String;

/// Longest vehicle id that fits the wire header.
pub const MAX_VEHICLE_ID_LEN: usize = u16::MAX as usize;

/// Error type for trace loading failures.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    FileRead(String),
    #[error("Failed to parse trace JSON: {0}")]
    Parse(String),
    #[error("Invalid trace: {0}")]
    Validation(String),
}

/// A vehicle entering the simulation, or moving within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub id: VehicleId,
    pub position: Point,
}

/// Everything the mobility engine reports for one synchronization step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MobilityTick {
    /// Step index; the tick happens at `step * sync_interval`.
    pub step: u64,
    #[serde(default)]
    pub arrivals: Vec<VehiclePosition>,
    #[serde(default)]
    pub departures: Vec<VehicleId>,
    #[serde(default)]
    pub updates: Vec<VehiclePosition>,
}

/// Anything able to feed mobility ticks to the simulation.
pub trait MobilitySource {
    /// Number of distinct vehicles the mobility description declares.
    /// Sizes the node pool.
    fn declared_vehicle_count(&self) -> usize;

    /// Next tick in step order, or `None` once the description is exhausted.
    fn next_tick(&mut self) -> Option<MobilityTick>;
}

#[derive(Debug, Clone, Deserialize)]
struct TraceFile {
    /// Explicit vehicle count; defaults to the number of distinct arriving ids.
    #[serde(default)]
    declared_vehicles: Option<usize>,
    ticks: Vec<MobilityTick>,
}

/// Mobility ticks replayed from a file.
#[derive(Debug, Clone)]
pub struct MobilityTrace {
    declared_vehicles: usize,
    ticks: VecDeque<MobilityTick>,
}

impl MobilityTrace {
    /// Build a trace from in-memory ticks, counting every distinct arriving id.
    pub fn from_ticks(ticks: Vec<MobilityTick>) -> Result<Self, TraceError> {
        let declared = count_distinct_vehicles(&ticks);
        Self::with_declared_count(declared, ticks)
    }

    pub fn with_declared_count(declared_vehicles: usize, ticks: Vec<MobilityTick>) -> Result<Self, TraceError> {
        validate_ticks(&ticks)?;
        Ok(Self {
            declared_vehicles,
            ticks: ticks.into(),
        })
    }

    pub fn from_json_str(data: &str) -> Result<Self, TraceError> {
        let file: TraceFile = serde_json::from_str(data).map_err(|e| TraceError::Parse(e.to_string()))?;
        match file.declared_vehicles {
            Some(declared) => Self::with_declared_count(declared, file.ticks),
            None => Self::from_ticks(file.ticks),
        }
    }

    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let data = std::fs::read_to_string(path).map_err(|e| TraceError::FileRead(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    pub fn remaining_ticks(&self) -> usize {
        self.ticks.len()
    }
}

impl MobilitySource for MobilityTrace {
    fn declared_vehicle_count(&self) -> usize {
        self.declared_vehicles
    }

    fn next_tick(&mut self) -> Option<MobilityTick> {
        self.ticks.pop_front()
    }
}

fn count_distinct_vehicles(ticks: &[MobilityTick]) -> usize {
    ticks.iter().flat_map(|t| t.arrivals.iter().map(|a| a.id.as_str())).collect::<HashSet<_>>().len()
}

/// Structural checks only. Lifecycle consistency (departures of unknown
/// vehicles, more concurrent vehicles than declared) is left to the node pool,
/// which treats it as fatal at the moment it happens.
fn validate_ticks(ticks: &[MobilityTick]) -> Result<(), TraceError> {
    let mut last_step: Option<u64> = None;
    for tick in ticks {
        if let Some(prev) = last_step {
            if tick.step <= prev {
                return Err(TraceError::Validation(format!("tick steps must be strictly increasing ({} after {})", tick.step, prev)));
            }
        }
        last_step = Some(tick.step);

        let mut seen = HashSet::new();
        for arrival in &tick.arrivals {
            if !seen.insert(arrival.id.as_str()) {
                return Err(TraceError::Validation(format!("vehicle {} arrives twice in step {}", arrival.id, tick.step)));
            }
        }
        for entry in tick.arrivals.iter().chain(tick.updates.iter()) {
            if entry.id.is_empty() || entry.id.len() > MAX_VEHICLE_ID_LEN {
                return Err(TraceError::Validation(format!(
                    "vehicle id of {} bytes in step {} must be 1..={} bytes",
                    entry.id.len(),
                    tick.step,
                    MAX_VEHICLE_ID_LEN
                )));
            }
            if !entry.position.is_finite() {
                return Err(TraceError::Validation(format!("vehicle {} has a non-finite position in step {}", entry.id, tick.step)));
            }
        }
    }
    Ok(())
}
