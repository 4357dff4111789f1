//! Vehicle side of the area speed advisor.
//!
//! One `AdvisorClient` lives per bound slot. It numbers outgoing beacons,
//! derives speed and heading from consecutive positions, and applies the
//! speed limit of every fresh advisory addressed to its vehicle.

use embassy_time::Instant;

use super::codec::{Advisory, Beacon, DecodeError, Message};
use crate::common::{Point, VehicleId, Zone};

/// Result of handling one received advisory payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvisoryOutcome {
    Applied { zone: Zone, speed_limit_mps: f64 },
    /// Sequence not newer than the last applied advisory.
    Stale { sequence: u32, last_applied: u32 },
    /// Advisory for another vehicle.
    NotForMe,
    /// Advisory without a speed-limit container; the zone is noted but nothing is applied.
    NoConstraint { zone: Zone },
    /// A well-formed payload that is not an advisory.
    UnexpectedKind,
    Malformed(DecodeError),
}

#[derive(Debug)]
pub struct AdvisorClient {
    vehicle_id: VehicleId,
    next_beacon_sequence: u32,
    last_fix: Option<(Point, Instant)>,
    heading_deg: f64,
    last_applied_sequence: Option<u32>,
    speed_limit_mps: Option<f64>,
    advised_zone: Option<Zone>,
}

impl AdvisorClient {
    pub fn new(vehicle_id: impl Into<VehicleId>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            next_beacon_sequence: 0,
            last_fix: None,
            heading_deg: 0.0,
            last_applied_sequence: None,
            speed_limit_mps: None,
            advised_zone: None,
        }
    }

    /// Speed limit currently applied to the vehicle.
    pub fn speed_limit_mps(&self) -> Option<f64> {
        self.speed_limit_mps
    }

    pub fn advised_zone(&self) -> Option<Zone> {
        self.advised_zone
    }

    /// Build the next beacon from the current position.
    pub fn next_beacon(&mut self, position: Point, now: Instant) -> Beacon {
        let speed_mps = match self.last_fix {
            Some((previous, at)) => {
                if let Some(heading) = previous.heading_to(&position) {
                    self.heading_deg = heading;
                }
                match now.checked_duration_since(at) {
                    Some(elapsed) if elapsed.as_micros() > 0 => previous.distance(&position) / (elapsed.as_micros() as f64 / 1_000_000.0),
                    _ => 0.0,
                }
            }
            None => 0.0,
        };
        self.last_fix = Some((position, now));

        let sequence = self.next_beacon_sequence;
        self.next_beacon_sequence = self.next_beacon_sequence.wrapping_add(1);

        Beacon {
            vehicle_id: self.vehicle_id.clone(),
            sequence,
            generated_at: now,
            position,
            speed_mps,
            heading_deg: self.heading_deg,
            applied_speed_limit_mps: self.speed_limit_mps,
        }
    }

    /// Decode and handle a raw payload received on the vehicle endpoint.
    pub fn on_payload(&mut self, payload: &[u8]) -> AdvisoryOutcome {
        match Message::decode(payload) {
            Ok(Message::Advisory(advisory)) => self.on_advisory(&advisory),
            Ok(Message::Beacon(beacon)) => {
                log::warn!("Vehicle {} dropping beacon {} of {}: not an advisory", self.vehicle_id, beacon.sequence, beacon.vehicle_id);
                AdvisoryOutcome::UnexpectedKind
            }
            Err(err) => {
                log::warn!("Vehicle {} dropping malformed advisory: {}", self.vehicle_id, err);
                AdvisoryOutcome::Malformed(err)
            }
        }
    }

    pub fn on_advisory(&mut self, advisory: &Advisory) -> AdvisoryOutcome {
        if advisory.vehicle_id != self.vehicle_id {
            log::debug!("Vehicle {} ignoring advisory for {}", self.vehicle_id, advisory.vehicle_id);
            return AdvisoryOutcome::NotForMe;
        }
        if let Some(last_applied) = self.last_applied_sequence {
            if advisory.sequence <= last_applied {
                log::debug!(
                    "Vehicle {} ignoring stale advisory {} (last applied {})",
                    self.vehicle_id,
                    advisory.sequence,
                    last_applied
                );
                return AdvisoryOutcome::Stale {
                    sequence: advisory.sequence,
                    last_applied,
                };
            }
        }
        self.last_applied_sequence = Some(advisory.sequence);
        self.advised_zone = Some(advisory.zone);

        match advisory.speed_limit_mps {
            Some(limit) => {
                self.speed_limit_mps = Some(limit);
                log::debug!("Vehicle {} applying {:.1} km/h in {} zone", self.vehicle_id, limit * 3.6, advisory.zone);
                AdvisoryOutcome::Applied {
                    zone: advisory.zone,
                    speed_limit_mps: limit,
                }
            }
            None => AdvisoryOutcome::NoConstraint { zone: advisory.zone },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisory(vehicle: &str, sequence: u32, zone: Zone, limit: Option<f64>) -> Advisory {
        Advisory {
            vehicle_id: vehicle.to_string(),
            sequence,
            generated_at: Instant::from_millis(0),
            zone,
            speed_limit_mps: limit,
        }
    }

    #[test]
    fn beacons_are_numbered_and_carry_motion() {
        let mut c = AdvisorClient::new("veh0");
        let b0 = c.next_beacon(Point::new(0.0, 0.0), Instant::from_millis(0));
        assert_eq!(b0.sequence, 0);
        assert_eq!(b0.speed_mps, 0.0);
        assert_eq!(b0.applied_speed_limit_mps, None);

        let b1 = c.next_beacon(Point::new(0.0, 2.0), Instant::from_millis(100));
        assert_eq!(b1.sequence, 1);
        assert!((b1.speed_mps - 20.0).abs() < 1e-9);
        assert!(b1.heading_deg.abs() < 1e-9);

        // Standing still keeps the last heading.
        let b2 = c.next_beacon(Point::new(0.0, 2.0), Instant::from_millis(200));
        assert_eq!(b2.speed_mps, 0.0);
        assert!(b2.heading_deg.abs() < 1e-9);
        assert_eq!(c.next_beacon(Point::new(0.0, 2.0), Instant::from_millis(300)).sequence, 3);
    }

    #[test]
    fn applies_fresh_advisories_and_ignores_stale_ones() {
        let mut c = AdvisorClient::new("veh0");
        let first = c.on_payload(&advisory("veh0", 1, Zone::Inner, Some(7.0)).encode());
        assert_eq!(first, AdvisoryOutcome::Applied { zone: Zone::Inner, speed_limit_mps: 7.0 });

        let late = c.on_advisory(&advisory("veh0", 0, Zone::Outer, Some(20.0)));
        assert_eq!(late, AdvisoryOutcome::Stale { sequence: 0, last_applied: 1 });
        let duplicate = c.on_advisory(&advisory("veh0", 1, Zone::Inner, Some(7.0)));
        assert!(matches!(duplicate, AdvisoryOutcome::Stale { .. }));

        assert_eq!(c.speed_limit_mps(), Some(7.0));
        assert_eq!(c.advised_zone(), Some(Zone::Inner));

        let beacon = c.next_beacon(Point::new(1.0, 1.0), Instant::from_millis(300));
        assert_eq!(beacon.applied_speed_limit_mps, Some(7.0));
    }

    #[test]
    fn advisory_without_limit_keeps_current_constraint() {
        let mut c = AdvisorClient::new("veh0");
        c.on_advisory(&advisory("veh0", 0, Zone::Outer, Some(20.0)));
        let outcome = c.on_advisory(&advisory("veh0", 1, Zone::Inner, None));
        assert_eq!(outcome, AdvisoryOutcome::NoConstraint { zone: Zone::Inner });
        assert_eq!(c.speed_limit_mps(), Some(20.0));
        assert_eq!(c.advised_zone(), Some(Zone::Inner));
    }

    #[test]
    fn rejects_foreign_and_malformed_payloads() {
        let mut c = AdvisorClient::new("veh0");
        assert_eq!(c.on_advisory(&advisory("veh1", 0, Zone::Inner, Some(7.0))), AdvisoryOutcome::NotForMe);
        let malformed = c.on_payload(&[0x00, 0x02]);
        assert!(matches!(malformed, AdvisoryOutcome::Malformed(DecodeError::Truncated { needed: 3, remaining: 2 })));
        assert_eq!(malformed.clone(), malformed);
        assert_eq!(c.speed_limit_mps(), None);
        assert_eq!(c.advised_zone(), None);
    }

    #[test]
    fn beacon_payload_is_unexpected_on_vehicle() {
        let mut c = AdvisorClient::new("veh0");
        let beacon = AdvisorClient::new("veh1").next_beacon(Point::new(3.0, 4.0), Instant::from_millis(10));
        assert_eq!(c.on_payload(&beacon.encode()), AdvisoryOutcome::UnexpectedKind);
        assert_eq!(c.speed_limit_mps(), None);
        // The vehicle's own numbering is untouched.
        assert_eq!(c.next_beacon(Point::new(0.0, 0.0), Instant::from_millis(20)).sequence, 0);
    }
}
