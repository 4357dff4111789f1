//! Wire format of beacons and advisories.
//!
//! Big-endian framing:
//!
//! ```text
//! u8   wire id (0x56)
//! u8   kind (0x01 beacon, 0x02 advisory)
//! u8   flags (bit 0: optional extension present)
//! u16  vehicle id length, then the UTF-8 vehicle id
//! u32  sequence number
//! u64  generation timestamp (virtual microseconds)
//!
//! beacon:   f64 x, f64 y, f64 speed (m/s), f64 heading (deg)
//!           [ext] f64 applied speed limit (m/s)
//! advisory: u8 zone (0 inner, 1 outer)
//!           [ext] f64 speed limit (m/s)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use embassy_time::Instant;
use thiserror::Error;

use crate::common::{Point, VehicleId, Zone};

/// The ID of the advisor codec on the wire.
pub const WIRE_ID: u8 = 0x56;

const KIND_BEACON: u8 = 0x01;
const KIND_ADVISORY: u8 = 0x02;

const FLAG_EXTENSION: u8 = 0x01;
const KNOWN_FLAGS: u8 = FLAG_EXTENSION;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("Invalid wire ID: {0:#04x}")]
    WireId(u8),
    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("Unknown flags: {0:#04x}")]
    UnknownFlags(u8),
    #[error("Truncated message: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("Vehicle id is not valid UTF-8")]
    InvalidVehicleId,
    #[error("Invalid zone: {0}")]
    InvalidZone(u8),
    #[error("Field {0} is not a finite number")]
    NonFinite(&'static str),
}

/// Which of the two message families a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Beacon,
    Advisory,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Beacon => write!(f, "beacon"),
            MessageKind::Advisory => write!(f, "advisory"),
        }
    }
}

/// Periodic status message sent by a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub vehicle_id: VehicleId,
    pub sequence: u32,
    pub generated_at: Instant,
    pub position: Point,
    pub speed_mps: f64,
    pub heading_deg: f64,
    /// Speed limit the vehicle is currently honouring, if any advisory was applied.
    pub applied_speed_limit_mps: Option<f64>,
}

/// Event-triggered message from the infrastructure to one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct Advisory {
    pub vehicle_id: VehicleId,
    pub sequence: u32,
    pub generated_at: Instant,
    /// Zone the vehicle just entered.
    pub zone: Zone,
    /// Maximum speed to apply; the optional speed-limit container.
    pub speed_limit_mps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Beacon(Beacon),
    Advisory(Advisory),
}

impl Message {
    /// Parse a complete payload. The whole buffer must be consumed.
    pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
        let mut src = payload;

        ensure(&src, 3)?;
        let wire_id = src.get_u8();
        if wire_id != WIRE_ID {
            return Err(DecodeError::WireId(wire_id));
        }
        let kind = src.get_u8();
        let flags = src.get_u8();
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::UnknownFlags(flags));
        }
        let has_extension = flags & FLAG_EXTENSION != 0;

        let header = decode_header(&mut src)?;

        let message = match kind {
            KIND_BEACON => {
                ensure(&src, 32)?;
                let x = finite(src.get_f64(), "x")?;
                let y = finite(src.get_f64(), "y")?;
                let speed_mps = finite(src.get_f64(), "speed")?;
                let heading_deg = finite(src.get_f64(), "heading")?;
                let applied_speed_limit_mps = if has_extension {
                    ensure(&src, 8)?;
                    Some(finite(src.get_f64(), "applied speed limit")?)
                } else {
                    None
                };
                Message::Beacon(Beacon {
                    vehicle_id: header.vehicle_id,
                    sequence: header.sequence,
                    generated_at: header.generated_at,
                    position: Point::new(x, y),
                    speed_mps,
                    heading_deg,
                    applied_speed_limit_mps,
                })
            }
            KIND_ADVISORY => {
                ensure(&src, 1)?;
                let zone = match src.get_u8() {
                    0 => Zone::Inner,
                    1 => Zone::Outer,
                    other => return Err(DecodeError::InvalidZone(other)),
                };
                let speed_limit_mps = if has_extension {
                    ensure(&src, 8)?;
                    Some(finite(src.get_f64(), "speed limit")?)
                } else {
                    None
                };
                Message::Advisory(Advisory {
                    vehicle_id: header.vehicle_id,
                    sequence: header.sequence,
                    generated_at: header.generated_at,
                    zone,
                    speed_limit_mps,
                })
            }
            other => return Err(DecodeError::UnknownKind(other)),
        };

        if src.has_remaining() {
            return Err(DecodeError::TrailingBytes(src.remaining()));
        }
        Ok(message)
    }
}

impl Beacon {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(header_len(&self.vehicle_id) + 40);
        encode_header(&mut dst, KIND_BEACON, self.applied_speed_limit_mps.is_some(), &self.vehicle_id, self.sequence, self.generated_at);
        dst.put_f64(self.position.x);
        dst.put_f64(self.position.y);
        dst.put_f64(self.speed_mps);
        dst.put_f64(self.heading_deg);
        if let Some(limit) = self.applied_speed_limit_mps {
            dst.put_f64(limit);
        }
        dst.freeze()
    }
}

impl Advisory {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(header_len(&self.vehicle_id) + 9);
        encode_header(&mut dst, KIND_ADVISORY, self.speed_limit_mps.is_some(), &self.vehicle_id, self.sequence, self.generated_at);
        dst.put_u8(match self.zone {
            Zone::Inner => 0,
            Zone::Outer => 1,
        });
        if let Some(limit) = self.speed_limit_mps {
            dst.put_f64(limit);
        }
        dst.freeze()
    }
}

struct Header {
    vehicle_id: VehicleId,
    sequence: u32,
    generated_at: Instant,
}

fn header_len(vehicle_id: &str) -> usize {
    3 + 2 + vehicle_id.len() + 4 + 8
}

/// # Panics
/// Panics if the vehicle id is larger than 65535 bytes.
fn encode_header(dst: &mut BytesMut, kind: u8, extension: bool, vehicle_id: &str, sequence: u32, generated_at: Instant) {
    dst.put_u8(WIRE_ID);
    dst.put_u8(kind);
    dst.put_u8(if extension { FLAG_EXTENSION } else { 0 });
    dst.put_u16(u16::try_from(vehicle_id.len()).expect("Vehicle id too large, max 65535 bytes"));
    dst.put_slice(vehicle_id.as_bytes());
    dst.put_u32(sequence);
    dst.put_u64(generated_at.as_micros());
}

fn decode_header(src: &mut &[u8]) -> Result<Header, DecodeError> {
    ensure(src, 2)?;
    let id_len = src.get_u16() as usize;
    ensure(src, id_len)?;
    let vehicle_id = std::str::from_utf8(&src[..id_len]).map_err(|_| DecodeError::InvalidVehicleId)?.to_string();
    src.advance(id_len);

    ensure(src, 12)?;
    let sequence = src.get_u32();
    let generated_at = Instant::from_micros(src.get_u64());

    Ok(Header {
        vehicle_id,
        sequence,
        generated_at,
    })
}

fn ensure(src: &&[u8], needed: usize) -> Result<(), DecodeError> {
    if src.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: src.remaining(),
        });
    }
    Ok(())
}

fn finite(value: f64, field: &'static str) -> Result<f64, DecodeError> {
    if value.is_finite() { Ok(value) } else { Err(DecodeError::NonFinite(field)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(limit: Option<f64>) -> Beacon {
        Beacon {
            vehicle_id: "veh12".to_string(),
            sequence: 42,
            generated_at: Instant::from_micros(1_250_000),
            position: Point::new(812.5, 907.25),
            speed_mps: 13.9,
            heading_deg: 270.0,
            applied_speed_limit_mps: limit,
        }
    }

    #[test]
    fn beacon_extension_is_optional() {
        let plain = beacon(None);
        let with_limit = beacon(Some(6.94));
        let plain_bytes = plain.encode();
        let ext_bytes = with_limit.encode();
        assert_eq!(ext_bytes.len(), plain_bytes.len() + 8);
        assert_eq!(plain_bytes[2], 0);
        assert_eq!(ext_bytes[2], FLAG_EXTENSION);
        assert_eq!(Message::decode(&plain_bytes), Ok(Message::Beacon(plain)));
        assert_eq!(Message::decode(&ext_bytes), Ok(Message::Beacon(with_limit)));
    }

    #[test]
    fn advisory_carries_zone_and_limit() {
        let advisory = Advisory {
            vehicle_id: "veh3".to_string(),
            sequence: 1,
            generated_at: Instant::from_millis(30),
            zone: Zone::Outer,
            speed_limit_mps: Some(20.83),
        };
        let bytes = advisory.encode();
        assert_eq!(bytes[1], KIND_ADVISORY);
        assert_eq!(Message::decode(&bytes), Ok(Message::Advisory(advisory)));
    }

    #[test]
    fn rejects_wrong_wire_id_and_kind() {
        let mut bytes = beacon(None).encode().to_vec();
        bytes[0] = 0x03;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::WireId(0x03)));
        bytes[0] = WIRE_ID;
        bytes[1] = 0x09;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::UnknownKind(0x09)));
        bytes[1] = KIND_BEACON;
        bytes[2] = 0x80;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::UnknownFlags(0x80)));
    }

    #[test]
    fn rejects_truncated_and_trailing_input() {
        let bytes = beacon(Some(5.0)).encode();
        for cut in [0, 2, 6, bytes.len() - 1] {
            assert!(matches!(Message::decode(&bytes[..cut]), Err(DecodeError::Truncated { .. })), "cut at {cut}");
        }
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert_eq!(Message::decode(&longer), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_invalid_zone_and_non_finite_fields() {
        let advisory = Advisory {
            vehicle_id: "v".to_string(),
            sequence: 0,
            generated_at: Instant::from_ticks(0),
            zone: Zone::Inner,
            speed_limit_mps: None,
        };
        let mut bytes = advisory.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 7;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::InvalidZone(7)));

        let mut bad = beacon(None);
        bad.speed_mps = f64::NAN;
        assert_eq!(Message::decode(&bad.encode()), Err(DecodeError::NonFinite("speed")));
    }

    #[test]
    fn rejects_non_utf8_vehicle_id() {
        let mut bytes = beacon(None).encode().to_vec();
        bytes[5] = 0xff;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::InvalidVehicleId));
    }
}
