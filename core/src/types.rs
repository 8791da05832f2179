//! Core wire-level data model: endpoints, allocations and packets.
//!
//! Everything that crosses the network is built from these types. The codec
//! (`crate::codec`) owns the byte-level representation; validation rules that
//! are independent of the encoding live here.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `host:port` string uniquely naming an agent on the wire.
///
/// Used both as the routing key for transports and as the logical node id in
/// the allocator's registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves the endpoint to a socket address, e.g. for binding or
    /// connecting a transport.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.0.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A power set-point valid for a bounded time.
///
/// `p` is active power in kW (negative = generation), `q` reactive power in
/// kvar, `duration` the validity horizon in seconds. `aid` is stamped by the
/// allocator from a monotonic counter and is deliberately excluded from
/// equality and ordering: two allocations describing the same set-point
/// compare equal regardless of when they were issued.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub aid: u64,
    pub p: f64,
    pub q: f64,
    pub duration: f64,
}

impl Allocation {
    pub fn new(aid: u64, p: f64, q: f64, duration: f64) -> Self {
        Self { aid, p, q, duration }
    }

    /// The "no cap" allocation a load starts out with.
    pub fn unbounded() -> Self {
        Self { aid: 0, p: f64::INFINITY, q: f64::INFINITY, duration: 0.0 }
    }

    fn key(&self) -> (f64, f64, f64) {
        (self.p, self.q, self.duration)
    }

    /// Applies a local cap: lexicographic `min` while consuming
    /// (`p >= 0`), lexicographic `max` while producing.
    pub fn capped_by(self, cap: Allocation) -> Allocation {
        let take_min = self.p >= 0.0;
        match self.partial_cmp(&cap) {
            Some(std::cmp::Ordering::Greater) => {
                if take_min {
                    cap
                } else {
                    self
                }
            }
            Some(_) => {
                if take_min {
                    self
                } else {
                    cap
                }
            }
            // Incomparable (NaN somewhere): keep the current set-point.
            None => self,
        }
    }
}

impl PartialEq for Allocation {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl PartialOrd for Allocation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.key().partial_cmp(&other.key())
    }
}

/// The enumerated set of protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Join,
    JoinAck,
    Allocation,
    AllocationAck,
    CurrAllocation,
    Stop,
    StopAck,
    Leave,
    LeaveAck,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Join => "join",
            PacketKind::JoinAck => "join_ack",
            PacketKind::Allocation => "allocation",
            PacketKind::AllocationAck => "allocation_ack",
            PacketKind::CurrAllocation => "curr_allocation",
            PacketKind::Stop => "stop",
            PacketKind::StopAck => "stop_ack",
            PacketKind::Leave => "leave",
            PacketKind::LeaveAck => "leave_ack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "join" => PacketKind::Join,
            "join_ack" => PacketKind::JoinAck,
            "allocation" => PacketKind::Allocation,
            "allocation_ack" => PacketKind::AllocationAck,
            "curr_allocation" => PacketKind::CurrAllocation,
            "stop" => PacketKind::Stop,
            "stop_ack" => PacketKind::StopAck,
            "leave" => PacketKind::Leave,
            "leave_ack" => PacketKind::LeaveAck,
            _ => return None,
        })
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A load's reported state: the set-point it is enforcing, its local cap and
/// its latest voltage measure. Doubles as the allocator's per-node record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub allocation: Allocation,
    pub max_allocation: Option<Allocation>,
    pub measure: f64,
}

/// Acknowledgement payload: the allocation being confirmed plus the measure
/// observed at the moment it was adopted.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub allocation: Allocation,
    pub measure: f64,
}

/// Packet payload variants; which kinds may carry which variant is enforced
/// by [`Packet::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Allocation(Allocation),
    Report(Report),
    Ack(Ack),
}

impl Payload {
    /// The allocation in the first payload slot, if any.
    pub fn allocation(&self) -> Option<&Allocation> {
        match self {
            Payload::Empty => None,
            Payload::Allocation(a) => Some(a),
            Payload::Report(r) => Some(&r.allocation),
            Payload::Ack(a) => Some(&a.allocation),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PacketError {
    #[error("`{kind}` packets must carry an allocation payload")]
    MissingAllocation { kind: PacketKind },
    #[error("`{kind}` packets do not carry a payload")]
    UnexpectedPayload { kind: PacketKind },
}

/// A typed protocol message. `src` identifies the sender; `dst`, when set,
/// lets the receiver reject traffic addressed to somebody else.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Payload,
    pub src: Endpoint,
    pub dst: Option<Endpoint>,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Payload, src: Endpoint, dst: Option<Endpoint>) -> Self {
        Self { kind, payload, src, dst }
    }

    /// A payload-less control packet.
    pub fn empty(kind: PacketKind, src: Endpoint, dst: Option<Endpoint>) -> Self {
        Self::new(kind, Payload::Empty, src, dst)
    }

    /// Checks the kind/payload pairing rules. Frames violating them are
    /// treated as malformed and dropped by the codec.
    pub fn validate(&self) -> Result<(), PacketError> {
        match self.kind {
            PacketKind::Allocation | PacketKind::CurrAllocation => match self.payload {
                Payload::Allocation(_) | Payload::Report(_) => Ok(()),
                _ => Err(PacketError::MissingAllocation { kind: self.kind }),
            },
            PacketKind::Join => match self.payload {
                Payload::Empty | Payload::Report(_) => Ok(()),
                _ => Err(PacketError::UnexpectedPayload { kind: self.kind }),
            },
            PacketKind::AllocationAck => match self.payload {
                Payload::Ack(_) | Payload::Allocation(_) => Ok(()),
                _ => Err(PacketError::MissingAllocation { kind: self.kind }),
            },
            PacketKind::JoinAck
            | PacketKind::Stop
            | PacketKind::StopAck
            | PacketKind::Leave
            | PacketKind::LeaveAck => {
                if self.payload.is_empty() {
                    Ok(())
                } else {
                    Err(PacketError::UnexpectedPayload { kind: self.kind })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_equality_ignores_aid() {
        let a = Allocation::new(1, 2.5, 0.1, 10.0);
        let b = Allocation::new(99, 2.5, 0.1, 10.0);
        assert_eq!(a, b);
        assert_ne!(a, Allocation::new(1, 2.5, 0.1, 11.0));
    }

    #[test]
    fn allocation_ordering_is_lexicographic() {
        let small = Allocation::new(0, 1.0, 9.0, 9.0);
        let large = Allocation::new(0, 2.0, 0.0, 0.0);
        assert!(small < large);

        let tie_p = Allocation::new(0, 1.0, 0.5, 0.0);
        assert!(tie_p < small);
    }

    #[test]
    fn capped_by_takes_min_when_consuming() {
        let curr = Allocation::new(0, 5.0, 0.0, 1.0);
        let cap = Allocation::new(0, 3.0, 0.0, 1.0);
        assert_eq!(curr.capped_by(cap), cap);
        assert_eq!(cap.capped_by(curr), cap);
    }

    #[test]
    fn capped_by_takes_max_when_producing() {
        // Producing 10 kW but capped to 4 kW of production.
        let curr = Allocation::new(0, -10.0, 0.0, 1.0);
        let cap = Allocation::new(0, -4.0, 0.0, 1.0);
        assert_eq!(curr.capped_by(cap), cap);
    }

    #[test]
    fn unbounded_cap_never_clamps_consumption() {
        let curr = Allocation::new(0, 123.0, 45.0, 1.0);
        assert_eq!(curr.capped_by(Allocation::unbounded()), curr);
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            PacketKind::Join,
            PacketKind::JoinAck,
            PacketKind::Allocation,
            PacketKind::AllocationAck,
            PacketKind::CurrAllocation,
            PacketKind::Stop,
            PacketKind::StopAck,
            PacketKind::Leave,
            PacketKind::LeaveAck,
        ] {
            assert_eq!(PacketKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PacketKind::parse("jon"), None);
    }

    #[test]
    fn validate_rejects_payload_on_control_kinds() {
        let packet = Packet::new(
            PacketKind::Stop,
            Payload::Allocation(Allocation::default()),
            Endpoint::from("127.0.0.1:5000"),
            None,
        );
        assert!(matches!(
            packet.validate(),
            Err(PacketError::UnexpectedPayload { kind: PacketKind::Stop })
        ));
    }

    #[test]
    fn validate_requires_allocation_first() {
        let packet = Packet::empty(PacketKind::Allocation, Endpoint::from("127.0.0.1:5000"), None);
        assert!(matches!(
            packet.validate(),
            Err(PacketError::MissingAllocation { kind: PacketKind::Allocation })
        ));
    }
}
