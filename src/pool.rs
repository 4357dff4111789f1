//! Fixed-capacity pool of vehicle endpoints.
//!
//! All endpoints are created once, before the run starts, one per vehicle the
//! mobility description declares. Vehicles appearing and disappearing during
//! the run are mapped onto these pre-built endpoints: a bind claims a free slot
//! and starts the endpoint's application, an unbind stops the application,
//! parks the endpoint far outside the map and frees the slot for reuse.
//!
//! The pool never creates or destroys endpoints at run time. Running out of
//! free slots, or being asked about an identity that is not bound, means the
//! mobility description and the pool disagree; both are reported as errors
//! the caller is expected to treat as fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::common::{MobilityTick, PARKED_POSITION, Point, VehicleId};

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    #[error("Node pool exhausted: cannot bind vehicle {vehicle}, all {capacity} slots are active")]
    PoolExhausted { vehicle: VehicleId, capacity: usize },
    #[error("Vehicle {0} is not bound to any slot")]
    UnknownIdentity(VehicleId),
    #[error("Vehicle {vehicle} is already bound to slot {slot}")]
    AlreadyBound { vehicle: VehicleId, slot: usize },
}

/// How a free slot is chosen on bind.
///
/// Changing the policy changes which endpoint a given vehicle lands on, and
/// therefore the reproducibility of a run; `LowestIndex` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotSelection {
    /// Always take the free slot with the smallest index.
    #[default]
    LowestIndex,
    /// Take the first free slot after the most recently bound one, wrapping around.
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    Free,
    Active,
    /// Application is being stopped; only observable from `stop_application`.
    Retiring,
}

/// One pre-allocated endpoint.
#[derive(Debug, Clone)]
pub struct VehicleSlot {
    index: usize,
    bound: Option<VehicleId>,
    state: SlotState,
    /// Bumped on every bind; tells apart traffic meant for earlier bindings.
    generation: u64,
    position: Point,
}

impl VehicleSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            bound: None,
            state: SlotState::Free,
            generation: 0,
            position: PARKED_POSITION,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bound_identity(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn position(&self) -> Point {
        self.position
    }
}

/// Application logic running on an endpoint, started and stopped by the pool.
pub trait EndpointLifecycle {
    /// Called once the slot is Active and bound to its new vehicle.
    fn start_application(&mut self, slot: &VehicleSlot);

    /// Called while the slot is Retiring, before it is parked and freed.
    /// Must cancel everything the application has scheduled for this slot.
    fn stop_application(&mut self, slot: &VehicleSlot);
}

/// Lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub binds: u64,
    pub unbinds: u64,
    pub exhaustion_events: u64,
    pub peak_active: usize,
}

/// Result of applying one mobility tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// (vehicle, slot) for every arrival, in trace order.
    pub bound: Vec<(VehicleId, usize)>,
    /// (vehicle, slot) for every departure, in trace order.
    pub unbound: Vec<(VehicleId, usize)>,
    pub moved: usize,
}

#[derive(Debug)]
pub struct NodePool {
    slots: Vec<VehicleSlot>,
    bindings: HashMap<VehicleId, usize>,
    selection: SlotSelection,
    last_bound: Option<usize>,
    stats: PoolStats,
}

impl NodePool {
    /// Pre-create `capacity` free endpoints.
    pub fn new(capacity: usize, selection: SlotSelection) -> Self {
        Self {
            slots: (0..capacity).map(VehicleSlot::new).collect(),
            bindings: HashMap::with_capacity(capacity),
            selection,
            last_bound: None,
            stats: PoolStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn slot(&self, index: usize) -> Option<&VehicleSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[VehicleSlot] {
        &self.slots
    }

    pub fn slot_of(&self, vehicle: &str) -> Option<usize> {
        self.bindings.get(vehicle).copied()
    }

    /// Claim a free slot for `vehicle`, place it at `position` and start its application.
    pub fn bind(&mut self, vehicle: &str, position: Point, app: &mut impl EndpointLifecycle) -> Result<usize, PoolError> {
        if let Some(&slot) = self.bindings.get(vehicle) {
            return Err(PoolError::AlreadyBound {
                vehicle: vehicle.to_string(),
                slot,
            });
        }

        let Some(index) = self.select_free_slot() else {
            self.stats.exhaustion_events += 1;
            log::error!("Node pool empty: {} slots active, cannot bind {}", self.slots.len(), vehicle);
            return Err(PoolError::PoolExhausted {
                vehicle: vehicle.to_string(),
                capacity: self.slots.len(),
            });
        };

        let slot = &mut self.slots[index];
        slot.bound = Some(vehicle.to_string());
        slot.state = SlotState::Active;
        slot.generation += 1;
        slot.position = position;
        self.bindings.insert(vehicle.to_string(), index);
        self.last_bound = Some(index);

        self.stats.binds += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.bindings.len());
        log::debug!("Bound vehicle {} to slot {} (generation {})", vehicle, index, self.slots[index].generation);

        app.start_application(&self.slots[index]);
        Ok(index)
    }

    /// Stop `vehicle`'s application, park its endpoint and free the slot.
    pub fn unbind(&mut self, vehicle: &str, app: &mut impl EndpointLifecycle) -> Result<usize, PoolError> {
        let index = self.bindings.remove(vehicle).ok_or_else(|| PoolError::UnknownIdentity(vehicle.to_string()))?;

        self.slots[index].state = SlotState::Retiring;
        app.stop_application(&self.slots[index]);

        let slot = &mut self.slots[index];
        slot.position = PARKED_POSITION;
        slot.bound = None;
        slot.state = SlotState::Free;

        self.stats.unbinds += 1;
        log::debug!("Unbound vehicle {} from slot {}, endpoint parked", vehicle, index);
        Ok(index)
    }

    /// Record a new position for a bound vehicle.
    pub fn update_position(&mut self, vehicle: &str, position: Point) -> Result<usize, PoolError> {
        let index = self.slot_of(vehicle).ok_or_else(|| PoolError::UnknownIdentity(vehicle.to_string()))?;
        self.slots[index].position = position;
        Ok(index)
    }

    /// Apply one synchronization tick: every arrival is bound before any
    /// departure is unbound, then positions are updated.
    ///
    /// Stops at the first error; the caller is expected to abort the run.
    pub fn apply_tick(&mut self, tick: &MobilityTick, app: &mut impl EndpointLifecycle) -> Result<TickOutcome, PoolError> {
        let mut outcome = TickOutcome::default();

        for arrival in &tick.arrivals {
            let slot = self.bind(&arrival.id, arrival.position, app)?;
            outcome.bound.push((arrival.id.clone(), slot));
        }
        for departure in &tick.departures {
            let slot = self.unbind(departure, app)?;
            outcome.unbound.push((departure.clone(), slot));
        }
        for update in &tick.updates {
            self.update_position(&update.id, update.position)?;
            outcome.moved += 1;
        }

        debug_assert!(self.is_consistent());
        Ok(outcome)
    }

    /// True when bindings and slots describe the same bijection.
    pub fn is_consistent(&self) -> bool {
        let active: Vec<&VehicleSlot> = self.slots.iter().filter(|s| s.state != SlotState::Free).collect();
        active.len() == self.bindings.len()
            && active.iter().all(|s| s.bound.as_deref().and_then(|v| self.bindings.get(v)) == Some(&s.index))
            && self.slots.iter().filter(|s| s.state == SlotState::Free).all(|s| s.bound.is_none())
    }

    fn select_free_slot(&self) -> Option<usize> {
        let is_free = |i: &usize| self.slots[*i].state == SlotState::Free;
        match self.selection {
            SlotSelection::LowestIndex => (0..self.slots.len()).find(is_free),
            SlotSelection::RoundRobin => {
                let start = self.last_bound.map_or(0, |i| i + 1);
                (start..self.slots.len()).chain(0..start.min(self.slots.len())).find(is_free)
            }
        }
    }
}
