//! Infrastructure side of the area speed advisor.
//!
//! The server follows every vehicle through its beacons. The first beacon of a
//! vehicle only records the zone it is in. Every later beacon recomputes the
//! zone, and when it differs from the last known one the server emits exactly
//! one advisory carrying the speed limit of the new zone.
//!
//! Records are dropped when the vehicle's endpoint is unbound; a vehicle that
//! comes back later starts from scratch.
//!
//! Advisory emission can be switched off. Zones are then still tracked and
//! crossings counted, but nothing is sent back.

use embassy_time::Instant;
use serde::Serialize;
use std::collections::HashMap;

use super::codec::{Advisory, Beacon, DecodeError, Message};
use crate::common::{AreaPartition, Point, VehicleId, Zone};

/// km/h to m/s.
pub fn kmh_to_mps(kmh: f64) -> f64 {
    kmh / 3.6
}

/// Last known state of one tracked vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleAdvisoryRecord {
    pub last_known_zone: Zone,
    pub last_position: Point,
    pub last_beacon_at: Instant,
    pub last_beacon_sequence: u32,
    next_advisory_sequence: u32,
}

/// What processing one beacon payload led to.
#[derive(Debug, Clone, PartialEq)]
pub enum BeaconOutcome {
    /// Payload could not be parsed; dropped.
    Malformed(DecodeError),
    /// Payload parsed but is not a beacon.
    UnexpectedKind,
    /// Older than (or equal to) the last beacon seen for this vehicle; dropped.
    Stale { sequence: u32, last_sequence: u32 },
    /// First beacon of the vehicle: tracking starts, no advisory.
    Tracked { zone: Zone },
    /// Zone unchanged.
    Unchanged { zone: Zone },
    /// Zone changed: one advisory to send.
    Transition { from: Zone, advisory: Advisory },
    /// Zone changed while advisory emission is off.
    Crossed { from: Zone, zone: Zone },
}

/// Server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub beacons_processed: u64,
    pub malformed_beacons: u64,
    pub stale_beacons: u64,
    /// Zone crossings seen, whether advised or not.
    pub zone_changes: u64,
    pub advisories_sent: u64,
    pub advisories_to_inner: u64,
    pub advisories_to_outer: u64,
}

#[derive(Debug)]
pub struct AdvisorServer {
    partition: AreaPartition,
    inner_limit_mps: f64,
    outer_limit_mps: f64,
    emit_advisories: bool,
    records: HashMap<VehicleId, VehicleAdvisoryRecord>,
    stats: ServerStats,
}

impl AdvisorServer {
    pub fn new(partition: AreaPartition, inner_limit_mps: f64, outer_limit_mps: f64) -> Self {
        Self {
            partition,
            inner_limit_mps,
            outer_limit_mps,
            emit_advisories: true,
            records: HashMap::new(),
            stats: ServerStats::default(),
        }
    }

    /// Turn advisory emission on or off (on by default).
    pub fn with_advisories(mut self, enabled: bool) -> Self {
        self.emit_advisories = enabled;
        self
    }

    pub fn speed_limit(&self, zone: Zone) -> f64 {
        match zone {
            Zone::Inner => self.inner_limit_mps,
            Zone::Outer => self.outer_limit_mps,
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn tracked_vehicles(&self) -> usize {
        self.records.len()
    }

    /// Parse and process a received payload.
    pub fn on_payload(&mut self, payload: &[u8], received_at: Instant) -> BeaconOutcome {
        match Message::decode(payload) {
            Ok(Message::Beacon(beacon)) => self.on_beacon(&beacon, received_at),
            Ok(Message::Advisory(advisory)) => {
                log::warn!("Server received an advisory for vehicle {}, dropping", advisory.vehicle_id);
                self.stats.malformed_beacons += 1;
                BeaconOutcome::UnexpectedKind
            }
            Err(err) => {
                log::warn!("Dropping malformed beacon ({} bytes): {}", payload.len(), err);
                self.stats.malformed_beacons += 1;
                BeaconOutcome::Malformed(err)
            }
        }
    }

    /// Process a decoded beacon.
    pub fn on_beacon(&mut self, beacon: &Beacon, received_at: Instant) -> BeaconOutcome {
        let zone = self.partition.zone_of(&beacon.position);
        let speed_limit_mps = self.speed_limit(zone);

        let Some(record) = self.records.get_mut(&beacon.vehicle_id) else {
            self.stats.beacons_processed += 1;
            self.records.insert(
                beacon.vehicle_id.clone(),
                VehicleAdvisoryRecord {
                    last_known_zone: zone,
                    last_position: beacon.position,
                    last_beacon_at: received_at,
                    last_beacon_sequence: beacon.sequence,
                    next_advisory_sequence: 0,
                },
            );
            log::debug!("Tracking vehicle {} starting in {} zone", beacon.vehicle_id, zone);
            return BeaconOutcome::Tracked { zone };
        };

        // Reordered by the channel: an older position must not move the zone back.
        if beacon.sequence <= record.last_beacon_sequence {
            self.stats.stale_beacons += 1;
            return BeaconOutcome::Stale {
                sequence: beacon.sequence,
                last_sequence: record.last_beacon_sequence,
            };
        }

        self.stats.beacons_processed += 1;
        record.last_position = beacon.position;
        record.last_beacon_at = received_at;
        record.last_beacon_sequence = beacon.sequence;

        let from = record.last_known_zone;
        if zone == from {
            return BeaconOutcome::Unchanged { zone };
        }

        record.last_known_zone = zone;
        self.stats.zone_changes += 1;
        if !self.emit_advisories {
            log::debug!("Vehicle {} moved {} -> {}, advisories off", beacon.vehicle_id, from, zone);
            return BeaconOutcome::Crossed { from, zone };
        }

        let sequence = record.next_advisory_sequence;
        record.next_advisory_sequence = record.next_advisory_sequence.wrapping_add(1);

        self.stats.advisories_sent += 1;
        match zone {
            Zone::Inner => self.stats.advisories_to_inner += 1,
            Zone::Outer => self.stats.advisories_to_outer += 1,
        }
        log::info!(
            "Vehicle {} moved {} -> {}, advising {:.1} km/h",
            beacon.vehicle_id,
            from,
            zone,
            speed_limit_mps * 3.6
        );

        BeaconOutcome::Transition {
            from,
            advisory: Advisory {
                vehicle_id: beacon.vehicle_id.clone(),
                sequence,
                generated_at: received_at,
                zone,
                speed_limit_mps: Some(speed_limit_mps),
            },
        }
    }

    /// Drop the record of a departed vehicle. Returns whether one existed.
    pub fn forget(&mut self, vehicle: &str) -> bool {
        self.records.remove(vehicle).is_some()
    }
}
