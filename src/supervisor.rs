//! Packet reception ratio (PRR) and latency supervision.
//!
//! Every message put on the channel is registered here when sent and resolved
//! when (if) it is received. Instances that stay unresolved longer than the
//! configured timeout are expired and counted as lost, so each instance is
//! closed exactly once: either as received (contributing a latency sample) or
//! as lost.
//!
//! An instance is identified by its message kind, vehicle, sequence number
//! and send time. Sequence numbers restart when a vehicle is rebound, so the
//! send time (carried in every payload) is what tells two bindings apart.
//!
//! Sends happen in non-decreasing virtual time and all instances share one
//! timeout, so deadlines are non-decreasing too; pending instances are kept in
//! a FIFO and expired from its front.

use embassy_time::{Duration, Instant};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

use crate::common::VehicleId;
use crate::protocol::MessageKind;

#[derive(Debug, Error, PartialEq)]
pub enum SupervisorError {
    #[error("Duplicate {kind} sequence {sequence} for vehicle {vehicle}: previous instance still pending")]
    DuplicateSequence { kind: MessageKind, vehicle: VehicleId, sequence: u32 },
    #[error("No pending {kind} instance {sequence} sent at {sent_at_us} us for vehicle {vehicle}")]
    UnknownInstance {
        kind: MessageKind,
        vehicle: VehicleId,
        sequence: u32,
        sent_at_us: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    kind: MessageKind,
    vehicle: VehicleId,
    sequence: u32,
    sent_at_ticks: u64,
}

impl InstanceKey {
    fn new(kind: MessageKind, vehicle: &str, sequence: u32, sent_at: Instant) -> Self {
        Self {
            kind,
            vehicle: vehicle.to_string(),
            sequence,
            sent_at_ticks: sent_at.as_ticks(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingInstance {
    sent_at: Instant,
    deadline: Instant,
}

/// Closed-instance aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReceptionStats {
    pub received: u64,
    pub lost: u64,
    /// Sum of latencies of received instances, in microseconds.
    pub latency_sum_us: u64,
    pub max_latency_us: u64,
}

impl ReceptionStats {
    fn record_received(&mut self, latency: Duration) {
        let us = latency.as_micros();
        self.received += 1;
        self.latency_sum_us += us;
        self.max_latency_us = self.max_latency_us.max(us);
    }

    pub fn closed(&self) -> u64 {
        self.received + self.lost
    }

    /// received / (received + lost); `None` before anything was closed.
    pub fn reception_ratio(&self) -> Option<f64> {
        match self.closed() {
            0 => None,
            closed => Some(self.received as f64 / closed as f64),
        }
    }

    /// Mean latency (ms) over received instances; `None` before the first reception.
    pub fn average_latency_ms(&self) -> Option<f64> {
        match self.received {
            0 => None,
            received => Some(self.latency_sum_us as f64 / received as f64 / 1000.0),
        }
    }
}

#[derive(Debug)]
pub struct PrrSupervisor {
    timeout: Duration,
    pending: HashMap<InstanceKey, PendingInstance>,
    /// Pending keys in send order; may hold keys already resolved.
    expiry_queue: VecDeque<(Instant, InstanceKey)>,
    overall: ReceptionStats,
    per_kind: BTreeMap<MessageKind, ReceptionStats>,
    per_vehicle: BTreeMap<VehicleId, ReceptionStats>,
    duplicate_sends: u64,
    unknown_receives: u64,
}

impl PrrSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
            expiry_queue: VecDeque::new(),
            overall: ReceptionStats::default(),
            per_kind: BTreeMap::new(),
            per_vehicle: BTreeMap::new(),
            duplicate_sends: 0,
            unknown_receives: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a sent message instance.
    pub fn record_send(&mut self, kind: MessageKind, vehicle: &str, sequence: u32, sent_at: Instant) -> Result<(), SupervisorError> {
        self.expire_due(sent_at);

        let key = InstanceKey::new(kind, vehicle, sequence, sent_at);
        if self.pending.contains_key(&key) {
            self.duplicate_sends += 1;
            return Err(SupervisorError::DuplicateSequence {
                kind,
                vehicle: key.vehicle,
                sequence,
            });
        }

        let deadline = sent_at + self.timeout;
        self.pending.insert(key.clone(), PendingInstance { sent_at, deadline });
        self.expiry_queue.push_back((deadline, key));
        Ok(())
    }

    /// Resolve a pending instance and return its latency. `sent_at` is the
    /// send time carried by the received payload.
    ///
    /// Instances whose deadline is not later than `received_at` are expired
    /// first, so a reception arriving after the timeout counts as lost.
    pub fn record_receive(
        &mut self,
        kind: MessageKind,
        vehicle: &str,
        sequence: u32,
        sent_at: Instant,
        received_at: Instant,
    ) -> Result<Duration, SupervisorError> {
        self.expire_due(received_at);

        let key = InstanceKey::new(kind, vehicle, sequence, sent_at);
        let Some(instance) = self.pending.remove(&key) else {
            self.unknown_receives += 1;
            return Err(SupervisorError::UnknownInstance {
                kind,
                vehicle: key.vehicle,
                sequence,
                sent_at_us: sent_at.as_micros(),
            });
        };

        let latency = received_at.checked_duration_since(instance.sent_at).unwrap_or(Duration::from_ticks(0));
        self.overall.record_received(latency);
        self.per_kind.entry(kind).or_default().record_received(latency);
        self.per_vehicle.entry(key.vehicle).or_default().record_received(latency);
        Ok(latency)
    }

    /// Expire every pending instance whose deadline is at or before `now`.
    /// Returns how many were counted as lost.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((deadline, _)) = self.expiry_queue.front() {
            if *deadline > now {
                break;
            }
            let Some((_, key)) = self.expiry_queue.pop_front() else {
                break;
            };
            // Already resolved entries are skipped; a re-sent key has a later deadline.
            match self.pending.get(&key) {
                Some(instance) if instance.deadline <= now => {
                    self.pending.remove(&key);
                    self.record_lost(&key);
                    expired += 1;
                }
                _ => {}
            }
        }
        expired
    }

    /// Close the run: everything still pending is counted as lost.
    pub fn finish(&mut self) -> usize {
        let keys: Vec<InstanceKey> = self.expiry_queue.drain(..).map(|(_, key)| key).collect();
        let mut expired = 0;
        for key in keys {
            if self.pending.remove(&key).is_some() {
                self.record_lost(&key);
                expired += 1;
            }
        }
        expired
    }

    fn record_lost(&mut self, key: &InstanceKey) {
        log::debug!("{} {} of vehicle {} expired", key.kind, key.sequence, key.vehicle);
        self.overall.lost += 1;
        self.per_kind.entry(key.kind).or_default().lost += 1;
        self.per_vehicle.entry(key.vehicle.clone()).or_default().lost += 1;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn average_packet_reception_ratio(&self) -> Option<f64> {
        self.overall.reception_ratio()
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        self.overall.average_latency_ms()
    }

    pub fn overall(&self) -> ReceptionStats {
        self.overall
    }

    pub fn by_kind(&self, kind: MessageKind) -> ReceptionStats {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    /// Per-vehicle aggregates, ordered by vehicle id.
    pub fn vehicles(&self) -> impl Iterator<Item = (&str, &ReceptionStats)> {
        self.per_vehicle.iter().map(|(v, s)| (v.as_str(), s))
    }

    pub fn duplicate_sends(&self) -> u64 {
        self.duplicate_sends
    }

    pub fn unknown_receives(&self) -> u64 {
        self.unknown_receives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADV: MessageKind = MessageKind::Advisory;
    const BCN: MessageKind = MessageKind::Beacon;

    fn ms(v: u64) -> Instant {
        Instant::from_millis(v)
    }

    #[test]
    fn single_round_gives_latency_and_full_ratio() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(150));
        assert_eq!(sup.average_packet_reception_ratio(), None);
        sup.record_send(ADV, "veh0", 1, ms(100)).unwrap();
        let latency = sup.record_receive(ADV, "veh0", 1, ms(100), ms(130)).unwrap();
        assert_eq!(latency, Duration::from_millis(30));
        assert_eq!(sup.average_packet_reception_ratio(), Some(1.0));
        assert_eq!(sup.average_latency_ms(), Some(30.0));
        assert_eq!(sup.pending(), 0);
    }

    #[test]
    fn unanswered_instances_expire_as_lost() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(100));
        let n = 10;
        let m = 4;
        for seq in 0..n {
            sup.record_send(BCN, "veh1", seq, ms(seq as u64)).unwrap();
        }
        for seq in m..n {
            sup.record_receive(BCN, "veh1", seq, ms(seq as u64), ms(seq as u64 + 20)).unwrap();
        }
        assert_eq!(sup.expire_due(ms(200)), m as usize);
        let ratio = sup.average_packet_reception_ratio().unwrap();
        assert!((ratio - (n - m) as f64 / n as f64).abs() < 1e-12);
        assert_eq!(sup.per_vehicle["veh1"].lost, m as u64);
    }

    #[test]
    fn all_lost_without_receives() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(100));
        for seq in 0..5 {
            sup.record_send(ADV, "v", seq, ms(0)).unwrap();
        }
        assert_eq!(sup.finish(), 5);
        assert_eq!(sup.average_packet_reception_ratio(), Some(0.0));
        assert_eq!(sup.average_latency_ms(), None);
    }

    #[test]
    fn late_receive_is_unknown_and_not_double_counted() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(50));
        sup.record_send(ADV, "veh0", 7, ms(0)).unwrap();
        let err = sup.record_receive(ADV, "veh0", 7, ms(0), ms(60)).unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownInstance { sequence: 7, .. }));
        assert_eq!(sup.overall().lost, 1);
        assert_eq!(sup.overall().received, 0);
        assert_eq!(sup.unknown_receives(), 1);
        // A second copy of the same message does not reopen the instance.
        assert!(sup.record_receive(ADV, "veh0", 7, ms(0), ms(61)).is_err());
        assert_eq!(sup.overall().closed(), 1);
    }

    #[test]
    fn duplicate_send_is_rejected_while_pending() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(50));
        sup.record_send(ADV, "veh0", 1, ms(0)).unwrap();
        assert!(matches!(sup.record_send(ADV, "veh0", 1, ms(0)), Err(SupervisorError::DuplicateSequence { .. })));
        assert_eq!(sup.duplicate_sends(), 1);
        // Same sequence for another kind or vehicle is an independent instance.
        sup.record_send(BCN, "veh0", 1, ms(10)).unwrap();
        sup.record_send(ADV, "veh9", 1, ms(10)).unwrap();
        // Once resolved, the sequence can be reused.
        sup.record_receive(ADV, "veh0", 1, ms(0), ms(20)).unwrap();
        sup.record_send(ADV, "veh0", 1, ms(30)).unwrap();
        assert_eq!(sup.pending(), 3);
    }

    #[test]
    fn restarted_sequence_is_a_new_instance() {
        // A rebound vehicle numbers its beacons from 0 again while the old 0 is in flight.
        let mut sup = PrrSupervisor::new(Duration::from_millis(150));
        sup.record_send(BCN, "veh0", 0, ms(0)).unwrap();
        sup.record_send(BCN, "veh0", 0, ms(20)).unwrap();
        assert_eq!(sup.duplicate_sends(), 0);
        assert_eq!(sup.pending(), 2);

        let latency = sup.record_receive(BCN, "veh0", 0, ms(20), ms(40)).unwrap();
        assert_eq!(latency, Duration::from_millis(20));
        assert_eq!(sup.finish(), 1);
        assert_eq!(sup.per_vehicle["veh0"], ReceptionStats {
            received: 1,
            lost: 1,
            latency_sum_us: 20_000,
            max_latency_us: 20_000,
        });
    }

    #[test]
    fn receive_with_unknown_send_time_is_rejected() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(150));
        sup.record_send(ADV, "veh0", 3, ms(100)).unwrap();
        let err = sup.record_receive(ADV, "veh0", 3, ms(90), ms(120)).unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownInstance { sent_at_us: 90_000, .. }));
        assert_eq!(sup.pending(), 1);
    }

    #[test]
    fn resent_key_keeps_its_own_deadline() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(50));
        sup.record_send(ADV, "veh0", 1, ms(0)).unwrap();
        sup.record_receive(ADV, "veh0", 1, ms(0), ms(10)).unwrap();
        sup.record_send(ADV, "veh0", 1, ms(40)).unwrap();
        // The stale queue entry from the first send (deadline 50) must not expire the new one.
        assert_eq!(sup.expire_due(ms(60)), 0);
        assert_eq!(sup.expire_due(ms(90)), 1);
        assert_eq!(sup.overall(), ReceptionStats {
            received: 1,
            lost: 1,
            latency_sum_us: 10_000,
            max_latency_us: 10_000,
        });
    }

    #[test]
    fn per_kind_breakdown() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(50));
        sup.record_send(ADV, "a", 0, ms(0)).unwrap();
        sup.record_send(BCN, "a", 0, ms(0)).unwrap();
        sup.record_receive(BCN, "a", 0, ms(0), ms(5)).unwrap();
        sup.finish();
        assert_eq!(sup.by_kind(BCN).reception_ratio(), Some(1.0));
        assert_eq!(sup.by_kind(ADV).reception_ratio(), Some(0.0));
        assert_eq!(sup.average_packet_reception_ratio(), Some(0.5));
        assert_eq!(sup.vehicles().count(), 1);
    }

    #[test]
    fn vehicles_are_listed_in_id_order() {
        let mut sup = PrrSupervisor::new(Duration::from_millis(50));
        for vehicle in ["veh2", "veh0", "veh1"] {
            sup.record_send(BCN, vehicle, 0, ms(0)).unwrap();
        }
        sup.finish();
        let ids: Vec<&str> = sup.vehicles().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["veh0", "veh1", "veh2"]);
    }
}
