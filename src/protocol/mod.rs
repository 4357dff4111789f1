//! Area-transition advisory protocol.
//!
//! Vehicles broadcast periodic beacons; the infrastructure answers with an
//! advisory only when a vehicle crosses between the inner and the outer zone.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{AdvisorClient, AdvisoryOutcome};
pub use codec::{Advisory, Beacon, DecodeError, Message, MessageKind, WIRE_ID};
pub use server::{AdvisorServer, BeaconOutcome, ServerStats, VehicleAdvisoryRecord, kmh_to_mps};
