//! Simulation runner.
//!
//! Drives one scenario over virtual time:
//! 1) Mobility ticks are pulled one at a time from the [`MobilitySource`] and
//!    applied to the node pool, which starts and stops vehicle applications.
//! 2) Each running application beacons periodically; beacons cross the lossy
//!    channel to the advisor server.
//! 3) Zone transitions detected by the server produce advisories that cross the
//!    channel back to the vehicle's endpoint.
//! 4) Both message kinds are registered with the PRR supervisor on send and
//!    resolved on receive.
//!
//! Deliveries are pinned to the slot binding they were sent from or to. A
//! payload whose vehicle endpoint was unbound (or rebound) while it was in
//! flight is discarded before any application sees it.

use bytes::Bytes;
use embassy_time::Instant;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use super::channel::{ChannelStats, Destination, LossyChannel};
use crate::common::{MobilitySource, MobilityTick, ScenarioConfig, VehicleId, config::BeaconConfig};
use crate::pool::{EndpointLifecycle, NodePool, PoolError, PoolStats, VehicleSlot};
use crate::protocol::{AdvisorClient, AdvisorServer, Advisory, AdvisoryOutcome, BeaconOutcome, Message, MessageKind, ServerStats, kmh_to_mps};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::supervisor::{PrrSupervisor, ReceptionStats, SupervisorError};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Mobility step {step} rejected by the node pool: {source}")]
    Mobility {
        step: u64,
        #[source]
        source: PoolError,
    },
}

#[derive(Debug)]
enum SimEvent {
    Mobility(MobilityTick),
    BeaconDue { slot: usize, generation: u64 },
    Deliver { from: Destination, to: Destination, payload: Bytes },
    StopApplications,
}

#[derive(Debug)]
struct VehicleApp {
    generation: u64,
    client: AdvisorClient,
    beacon_timer: Option<TimerHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunCounters {
    pub mobility_ticks: u64,
    pub beacons_sent: u64,
    pub advisories_applied: u64,
    pub stale_advisories: u64,
    /// Vehicle payloads that failed to decode or were not advisories.
    pub malformed_advisories: u64,
    /// Advisories addressed to another vehicle than the endpoint's.
    pub misaddressed_advisories: u64,
    /// Payloads discarded because their vehicle endpoint was unbound in flight.
    pub late_deliveries: u64,
    /// Beacon timers removed from the queue by an unbind.
    pub beacon_timers_cancelled: u64,
    /// Beacon timers that fired for a slot no longer running that application.
    pub stale_callbacks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceptionSummary {
    pub overall: ReceptionStats,
    pub beacons: ReceptionStats,
    pub advisories: ReceptionStats,
    pub duplicate_sends: u64,
    pub unknown_receives: u64,
    /// Both message kinds together, per vehicle id.
    pub per_vehicle: BTreeMap<VehicleId, ReceptionStats>,
}

/// Everything a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub sim_time_s: f64,
    pub declared_vehicles: usize,
    pub avg_prr: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub pool: PoolStats,
    pub server: ServerStats,
    pub counters: RunCounters,
    pub channel: ChannelStats,
    /// `None` when PRR supervision is disabled.
    pub reception: Option<ReceptionSummary>,
}

impl RunSummary {
    pub fn advisories_sent(&self) -> u64 {
        self.server.advisories_sent
    }

    pub fn beacons_processed(&self) -> u64 {
        self.server.beacons_processed
    }

    pub fn pool_exhaustion_events(&self) -> u64 {
        self.pool.exhaustion_events
    }
}

/// Starts and stops vehicle applications on behalf of the node pool.
struct ApplicationHost<'a> {
    scheduler: &'a mut Scheduler<SimEvent>,
    apps: &'a mut [Option<VehicleApp>],
    server: &'a mut AdvisorServer,
    counters: &'a mut RunCounters,
    beacon: &'a BeaconConfig,
    beaconing: bool,
}

impl EndpointLifecycle for ApplicationHost<'_> {
    fn start_application(&mut self, slot: &VehicleSlot) {
        let Some(vehicle) = slot.bound_identity() else {
            return;
        };
        let beacon_timer = self.beaconing.then(|| {
            self.scheduler.schedule_in(
                self.beacon.phase_for_slot(slot.index()),
                SimEvent::BeaconDue {
                    slot: slot.index(),
                    generation: slot.generation(),
                },
            )
        });
        self.apps[slot.index()] = Some(VehicleApp {
            generation: slot.generation(),
            client: AdvisorClient::new(vehicle),
            beacon_timer,
        });
        log::info!("Vehicle {} started on slot {}", vehicle, slot.index());
    }

    fn stop_application(&mut self, slot: &VehicleSlot) {
        if let Some(app) = self.apps[slot.index()].take() {
            if let Some(timer) = app.beacon_timer {
                if self.scheduler.cancel(timer).is_some() {
                    self.counters.beacon_timers_cancelled += 1;
                    log::debug!("Cancelled beacon of slot {} due at {} ms", slot.index(), timer.deadline().as_millis());
                }
            }
        }
        if let Some(vehicle) = slot.bound_identity() {
            self.server.forget(vehicle);
            log::info!("Vehicle {} stopped on slot {}", vehicle, slot.index());
        }
    }
}

pub struct Simulation<M: MobilitySource> {
    config: ScenarioConfig,
    mobility: M,
    pool: NodePool,
    scheduler: Scheduler<SimEvent>,
    channel: LossyChannel,
    server: AdvisorServer,
    supervisor: Option<PrrSupervisor>,
    apps: Vec<Option<VehicleApp>>,
    counters: RunCounters,
    beaconing: bool,
}

impl<M: MobilitySource> Simulation<M> {
    /// Build a run over the channel described by the scenario.
    pub fn new(config: ScenarioConfig, mobility: M) -> Self {
        let channel = LossyChannel::new(&config.channel);
        Self::with_channel(config, mobility, channel)
    }

    pub fn with_channel(config: ScenarioConfig, mobility: M, channel: LossyChannel) -> Self {
        let capacity = mobility.declared_vehicle_count();
        let server = AdvisorServer::new(
            config.area.partition(),
            kmh_to_mps(config.advisor.inner_speed_limit_kmh),
            kmh_to_mps(config.advisor.outer_speed_limit_kmh),
        )
        .with_advisories(config.advisor.enabled);
        let supervisor = config.supervisor.enabled.then(|| PrrSupervisor::new(config.supervisor.timeout()));
        let on_off = |enabled: bool| if enabled { "on" } else { "off" };
        log::info!(
            "Node pool of {} endpoints, inner area {:?}, beacons {} every {} ms, advisories {}, PRR supervision {}",
            capacity,
            config.area.partition().inner(),
            on_off(config.beacon.enabled),
            config.beacon.interval_ms,
            on_off(config.advisor.enabled),
            on_off(supervisor.is_some())
        );
        if let Some(supervisor) = &supervisor {
            log::debug!("Unresolved messages are lost after {} ms", supervisor.timeout().as_millis());
        }

        Self {
            pool: NodePool::new(capacity, config.pool.slot_selection),
            scheduler: Scheduler::new(),
            channel,
            server,
            supervisor,
            apps: (0..capacity).map(|_| None).collect(),
            counters: RunCounters::default(),
            beaconing: config.beacon.enabled,
            mobility,
            config,
        }
    }

    /// Run the scenario to completion.
    pub fn run(mut self) -> Result<RunSummary, SimulationError> {
        let origin = Instant::from_ticks(0);
        let end = origin + self.config.run.sim_time();

        self.schedule_next_tick();
        self.scheduler.schedule_at(origin + self.config.run.app_stop_time(), SimEvent::StopApplications);

        while let Some((now, event)) = self.scheduler.pop_until(end) {
            if let Some(supervisor) = self.supervisor.as_mut() {
                supervisor.expire_due(now);
            }
            match event {
                SimEvent::Mobility(tick) => self.on_mobility(tick)?,
                SimEvent::BeaconDue { slot, generation } => self.on_beacon_due(slot, generation, now),
                SimEvent::Deliver { from, to, payload } => self.on_deliver(from, to, payload, now),
                SimEvent::StopApplications => self.stop_applications(),
            }
        }
        if self.scheduler.pending() > 0 {
            log::debug!("{} events still queued past the end of the run", self.scheduler.pending());
        }
        self.scheduler.advance_to(end);

        if let Some(supervisor) = self.supervisor.as_mut() {
            if supervisor.pending() > 0 {
                log::debug!("{} instances still pending at the end of the run counted as lost", supervisor.pending());
            }
            supervisor.finish();
        }
        log::debug!("Server still tracks {} vehicles", self.server.tracked_vehicles());

        let summary = self.summary();
        log::info!(
            "Run finished: {} advisories sent, {} beacons processed, {} pool exhaustion events",
            summary.advisories_sent(),
            summary.beacons_processed(),
            summary.pool_exhaustion_events()
        );
        Ok(summary)
    }

    fn schedule_next_tick(&mut self) {
        if let Some(tick) = self.mobility.next_tick() {
            let offset = self.config.run.sync_interval().as_micros().saturating_mul(tick.step);
            self.scheduler.schedule_at(Instant::from_micros(offset), SimEvent::Mobility(tick));
        }
    }

    fn on_mobility(&mut self, tick: MobilityTick) -> Result<(), SimulationError> {
        let mut host = ApplicationHost {
            scheduler: &mut self.scheduler,
            apps: &mut self.apps,
            server: &mut self.server,
            counters: &mut self.counters,
            beacon: &self.config.beacon,
            beaconing: self.beaconing,
        };
        let outcome = self
            .pool
            .apply_tick(&tick, &mut host)
            .map_err(|source| SimulationError::Mobility { step: tick.step, source })?;

        self.counters.mobility_ticks += 1;
        if !outcome.bound.is_empty() || !outcome.unbound.is_empty() {
            log::debug!(
                "Step {}: {} arrivals, {} departures, {} active",
                tick.step,
                outcome.bound.len(),
                outcome.unbound.len(),
                self.pool.active_count()
            );
        }
        self.schedule_next_tick();
        Ok(())
    }

    fn on_beacon_due(&mut self, slot: usize, generation: u64, now: Instant) {
        let Some(position) = self.pool.slot(slot).map(|s| s.position()) else {
            return;
        };
        let Some(app) = self.apps.get_mut(slot).and_then(Option::as_mut).filter(|app| app.generation == generation) else {
            self.counters.stale_callbacks += 1;
            log::warn!("Beacon timer fired for slot {} generation {} after its application stopped", slot, generation);
            return;
        };

        let beacon = app.client.next_beacon(position, now);
        app.beacon_timer = self
            .beaconing
            .then(|| self.scheduler.schedule_in(self.config.beacon.interval(), SimEvent::BeaconDue { slot, generation }));
        self.counters.beacons_sent += 1;

        self.register_send(MessageKind::Beacon, &beacon.vehicle_id, beacon.sequence, beacon.generated_at);
        self.send(Destination::Vehicle { slot, generation }, Destination::Server, beacon.encode(), now);
    }

    fn on_deliver(&mut self, from: Destination, to: Destination, payload: Bytes, now: Instant) {
        if !self.endpoint_is_current(from) || !self.endpoint_is_current(to) {
            self.counters.late_deliveries += 1;
            log::debug!("Discarding delivery {:?} -> {:?}: endpoint no longer bound", from, to);
            return;
        }
        match to {
            Destination::Server => self.deliver_to_server(&payload, now),
            Destination::Vehicle { slot, .. } => self.deliver_to_vehicle(slot, &payload, now),
        }
    }

    fn deliver_to_server(&mut self, payload: &[u8], now: Instant) {
        let Ok(Message::Beacon(beacon)) = Message::decode(payload) else {
            // Counted and logged by the server.
            self.server.on_payload(payload, now);
            return;
        };
        self.resolve_receive(MessageKind::Beacon, &beacon.vehicle_id, beacon.sequence, beacon.generated_at, now);
        if let BeaconOutcome::Transition { advisory, .. } = self.server.on_beacon(&beacon, now) {
            self.send_advisory(advisory, now);
        }
    }

    fn send_advisory(&mut self, advisory: Advisory, now: Instant) {
        let Some(slot) = self.pool.slot_of(&advisory.vehicle_id) else {
            log::debug!("Advisory for {} dropped: vehicle left", advisory.vehicle_id);
            return;
        };
        let generation = self.pool.slot(slot).map_or(0, |s| s.generation());
        self.register_send(MessageKind::Advisory, &advisory.vehicle_id, advisory.sequence, advisory.generated_at);
        self.send(Destination::Server, Destination::Vehicle { slot, generation }, advisory.encode(), now);
    }

    fn deliver_to_vehicle(&mut self, slot: usize, payload: &[u8], now: Instant) {
        let decoded = Message::decode(payload);
        if let Ok(Message::Advisory(advisory)) = &decoded {
            self.resolve_receive(MessageKind::Advisory, &advisory.vehicle_id, advisory.sequence, advisory.generated_at, now);
        }
        let Some(app) = self.apps.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        let outcome = match &decoded {
            Ok(Message::Advisory(advisory)) => app.client.on_advisory(advisory),
            _ => app.client.on_payload(payload),
        };
        match outcome {
            AdvisoryOutcome::Applied { .. } => self.counters.advisories_applied += 1,
            AdvisoryOutcome::Stale { .. } => self.counters.stale_advisories += 1,
            AdvisoryOutcome::Malformed(_) | AdvisoryOutcome::UnexpectedKind => self.counters.malformed_advisories += 1,
            AdvisoryOutcome::NotForMe => self.counters.misaddressed_advisories += 1,
            AdvisoryOutcome::NoConstraint { .. } => {}
        }
    }

    fn stop_applications(&mut self) {
        self.beaconing = false;
        let mut stopped = 0;
        for app in self.apps.iter_mut().flatten() {
            if let Some(timer) = app.beacon_timer.take() {
                self.scheduler.cancel(timer);
                stopped += 1;
            }
        }
        log::info!("Stopping beacons on {} vehicles at {} ms", stopped, self.scheduler.now().as_millis());
    }

    fn send(&mut self, from: Destination, to: Destination, payload: Bytes, now: Instant) {
        match self.channel.transmit(now) {
            Some(arrival) => {
                self.scheduler.schedule_at(arrival, SimEvent::Deliver { from, to, payload });
            }
            None => log::trace!("Channel dropped payload {:?} -> {:?}", from, to),
        }
    }

    fn endpoint_is_current(&self, endpoint: Destination) -> bool {
        match endpoint {
            Destination::Server => true,
            Destination::Vehicle { slot, generation } => self
                .apps
                .get(slot)
                .and_then(Option::as_ref)
                .is_some_and(|app| app.generation == generation),
        }
    }

    /// `sent_at` is the generation timestamp stamped into the payload.
    fn register_send(&mut self, kind: MessageKind, vehicle: &str, sequence: u32, sent_at: Instant) {
        if let Some(supervisor) = self.supervisor.as_mut() {
            if let Err(err) = supervisor.record_send(kind, vehicle, sequence, sent_at) {
                log::warn!("{}", err);
            }
        }
    }

    fn resolve_receive(&mut self, kind: MessageKind, vehicle: &str, sequence: u32, sent_at: Instant, now: Instant) {
        let Some(supervisor) = self.supervisor.as_mut() else {
            return;
        };
        match supervisor.record_receive(kind, vehicle, sequence, sent_at, now) {
            Ok(latency) => log::trace!("{} {} of {} received after {} us", kind, sequence, vehicle, latency.as_micros()),
            Err(err @ SupervisorError::UnknownInstance { .. }) => log::debug!("{}", err),
            Err(err) => log::warn!("{}", err),
        }
    }

    fn summary(&self) -> RunSummary {
        let reception = self.supervisor.as_ref().map(|s| ReceptionSummary {
            overall: s.overall(),
            beacons: s.by_kind(MessageKind::Beacon),
            advisories: s.by_kind(MessageKind::Advisory),
            duplicate_sends: s.duplicate_sends(),
            unknown_receives: s.unknown_receives(),
            per_vehicle: s.vehicles().map(|(id, stats)| (id.to_string(), *stats)).collect(),
        });
        RunSummary {
            sim_time_s: self.config.run.sim_time_s,
            declared_vehicles: self.pool.capacity(),
            avg_prr: self.supervisor.as_ref().and_then(|s| s.average_packet_reception_ratio()),
            avg_latency_ms: self.supervisor.as_ref().and_then(|s| s.average_latency_ms()),
            pool: self.pool.stats(),
            server: self.server.stats(),
            counters: self.counters,
            channel: self.channel.stats(),
            reception,
        }
    }
}
