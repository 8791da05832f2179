//! Wire codec: MessagePack frames with two reserved extension tags.
//!
//! Ext `1` wraps a packet encoded as the array `[kind, payload, src, dst]`;
//! ext `2` wraps an allocation encoded as `[aid, p, q, duration]`. Strings
//! are UTF-8, integers variable-width, floats IEEE-754 binary64. Payload wire
//! forms: empty -> nil, bare allocation -> ext 2, report -> `[ext2, ext2|nil,
//! f64]`, ack -> `[ext2, f64]`.
//!
//! Decoding is strict: unknown kinds, wrong extension tags and payload-shape
//! violations are all rejected so the dispatcher never sees a half-valid
//! packet.

use std::fmt::Display;
use std::io::{Cursor, Read};

use rmp::Marker;
use rmp::{decode, encode};
use thiserror::Error;

use crate::types::{Ack, Allocation, Endpoint, Packet, PacketError, PacketKind, Payload, Report};

/// Extension tag wrapping a packet frame.
pub const EXT_PACKET: i8 = 1;
/// Extension tag wrapping an allocation.
pub const EXT_ALLOCATION: i8 = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated frame")]
    Truncated,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("malformed frame: {0}")]
    Field(String),
    #[error("unknown packet kind `{0}`")]
    UnknownKind(String),
    #[error("unexpected extension tag {0}")]
    UnexpectedTag(i8),
    #[error(transparent)]
    Invalid(#[from] PacketError),
}

fn field<E: Display>(err: E) -> CodecError {
    CodecError::Field(err.to_string())
}

/// Serializes a packet into an ext-tagged frame. Never fails for packets
/// passing [`Packet::validate`].
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    packet.validate()?;

    let mut inner = Vec::with_capacity(96);
    encode::write_array_len(&mut inner, 4).map_err(field)?;
    encode::write_str(&mut inner, packet.kind.as_str()).map_err(field)?;
    write_payload(&mut inner, &packet.payload)?;
    encode::write_str(&mut inner, packet.src.as_str()).map_err(field)?;
    match &packet.dst {
        Some(dst) => encode::write_str(&mut inner, dst.as_str()).map_err(field)?,
        None => encode::write_nil(&mut inner).map_err(field)?,
    }

    let mut frame = Vec::with_capacity(inner.len() + 6);
    encode::write_ext_meta(&mut frame, inner.len() as u32, EXT_PACKET).map_err(field)?;
    frame.extend_from_slice(&inner);
    Ok(frame)
}

/// Deserializes and validates a frame produced by [`encode`].
pub fn decode(buf: &[u8]) -> Result<Packet, CodecError> {
    let mut cur = Cursor::new(buf);
    let meta = decode::read_ext_meta(&mut cur).map_err(field)?;
    if meta.typeid != EXT_PACKET {
        return Err(CodecError::UnexpectedTag(meta.typeid));
    }
    let inner = take_bytes(&mut cur, meta.size as usize)?;
    let mut cur = Cursor::new(inner);

    let len = decode::read_array_len(&mut cur).map_err(field)?;
    if len != 4 {
        return Err(CodecError::Malformed("packet frame must be a 4-element array"));
    }
    let kind_str = read_string(&mut cur)?;
    let kind = PacketKind::parse(&kind_str).ok_or(CodecError::UnknownKind(kind_str))?;
    let payload = read_payload(&mut cur)?;
    let src = Endpoint::new(read_string(&mut cur)?);
    let dst = match peek_marker(&cur)? {
        Marker::Null => {
            decode::read_nil(&mut cur).map_err(field)?;
            None
        }
        _ => Some(Endpoint::new(read_string(&mut cur)?)),
    };

    let packet = Packet::new(kind, payload, src, dst);
    packet.validate()?;
    Ok(packet)
}

fn write_payload(out: &mut Vec<u8>, payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::Empty => encode::write_nil(out).map_err(field)?,
        Payload::Allocation(a) => write_allocation(out, a)?,
        Payload::Report(r) => {
            encode::write_array_len(out, 3).map_err(field)?;
            write_allocation(out, &r.allocation)?;
            match &r.max_allocation {
                Some(max) => write_allocation(out, max)?,
                None => encode::write_nil(out).map_err(field)?,
            }
            encode::write_f64(out, r.measure).map_err(field)?;
        }
        Payload::Ack(a) => {
            encode::write_array_len(out, 2).map_err(field)?;
            write_allocation(out, &a.allocation)?;
            encode::write_f64(out, a.measure).map_err(field)?;
        }
    }
    Ok(())
}

fn write_allocation(out: &mut Vec<u8>, a: &Allocation) -> Result<(), CodecError> {
    let mut inner = Vec::with_capacity(32);
    encode::write_array_len(&mut inner, 4).map_err(field)?;
    encode::write_uint(&mut inner, a.aid).map_err(field)?;
    encode::write_f64(&mut inner, a.p).map_err(field)?;
    encode::write_f64(&mut inner, a.q).map_err(field)?;
    encode::write_f64(&mut inner, a.duration).map_err(field)?;

    encode::write_ext_meta(out, inner.len() as u32, EXT_ALLOCATION).map_err(field)?;
    out.extend_from_slice(&inner);
    Ok(())
}

fn read_payload(cur: &mut Cursor<&[u8]>) -> Result<Payload, CodecError> {
    match peek_marker(cur)? {
        Marker::Null => {
            decode::read_nil(cur).map_err(field)?;
            Ok(Payload::Empty)
        }
        Marker::FixExt1
        | Marker::FixExt2
        | Marker::FixExt4
        | Marker::FixExt8
        | Marker::FixExt16
        | Marker::Ext8
        | Marker::Ext16
        | Marker::Ext32 => Ok(Payload::Allocation(read_allocation(cur)?)),
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
            let len = decode::read_array_len(cur).map_err(field)?;
            match len {
                2 => {
                    let allocation = read_allocation(cur)?;
                    let measure = decode::read_f64(cur).map_err(field)?;
                    Ok(Payload::Ack(Ack { allocation, measure }))
                }
                3 => {
                    let allocation = read_allocation(cur)?;
                    let max_allocation = match peek_marker(cur)? {
                        Marker::Null => {
                            decode::read_nil(cur).map_err(field)?;
                            None
                        }
                        _ => Some(read_allocation(cur)?),
                    };
                    let measure = decode::read_f64(cur).map_err(field)?;
                    Ok(Payload::Report(Report { allocation, max_allocation, measure }))
                }
                _ => Err(CodecError::Malformed("payload list must have 2 or 3 elements")),
            }
        }
        _ => Err(CodecError::Malformed("unsupported payload shape")),
    }
}

fn read_allocation(cur: &mut Cursor<&[u8]>) -> Result<Allocation, CodecError> {
    let meta = decode::read_ext_meta(cur).map_err(field)?;
    if meta.typeid != EXT_ALLOCATION {
        return Err(CodecError::UnexpectedTag(meta.typeid));
    }
    let inner = take_bytes(cur, meta.size as usize)?;
    let mut cur = Cursor::new(inner);

    let len = decode::read_array_len(&mut cur).map_err(field)?;
    if len != 4 {
        return Err(CodecError::Malformed("allocation must be a 4-element array"));
    }
    let aid: u64 = decode::read_int(&mut cur).map_err(field)?;
    let p = decode::read_f64(&mut cur).map_err(field)?;
    let q = decode::read_f64(&mut cur).map_err(field)?;
    let duration = decode::read_f64(&mut cur).map_err(field)?;
    Ok(Allocation { aid, p, q, duration })
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let len = decode::read_str_len(cur).map_err(field)? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(|_| CodecError::Truncated)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Malformed("string field is not UTF-8"))
}

/// Borrows the next `len` bytes out of the cursor's backing slice.
fn take_bytes<'a>(cur: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], CodecError> {
    let start = cur.position() as usize;
    let end = start.checked_add(len).ok_or(CodecError::Truncated)?;
    let bytes = cur.get_ref().get(start..end).ok_or(CodecError::Truncated)?;
    cur.set_position(end as u64);
    Ok(bytes)
}

fn peek_marker(cur: &Cursor<&[u8]>) -> Result<Marker, CodecError> {
    let pos = cur.position() as usize;
    cur.get_ref()
        .get(pos)
        .copied()
        .map(Marker::from_u8)
        .ok_or(CodecError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::from(s)
    }

    fn round_trip(packet: Packet) {
        let frame = encode(&packet).expect("encode");
        let decoded = decode(&frame).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_every_kind() {
        let alloc = Allocation::new(7, -2.5, 0.25, 10.0);
        round_trip(Packet::new(
            PacketKind::Join,
            Payload::Report(Report { allocation: alloc, max_allocation: None, measure: 0.0 }),
            ep("127.0.0.1:5100"),
            Some(ep("127.0.0.1:5000")),
        ));
        round_trip(Packet::empty(PacketKind::JoinAck, ep("127.0.0.1:5000"), Some(ep("127.0.0.1:5100"))));
        round_trip(Packet::new(
            PacketKind::Allocation,
            Payload::Allocation(alloc),
            ep("127.0.0.1:5000"),
            Some(ep("127.0.0.1:5100")),
        ));
        round_trip(Packet::new(
            PacketKind::AllocationAck,
            Payload::Ack(Ack { allocation: alloc, measure: 1.02 }),
            ep("127.0.0.1:5100"),
            Some(ep("127.0.0.1:5000")),
        ));
        round_trip(Packet::new(
            PacketKind::CurrAllocation,
            Payload::Report(Report {
                allocation: alloc,
                max_allocation: Some(Allocation::new(0, -30.0, 0.0, 10.0)),
                measure: 1.04,
            }),
            ep("127.0.0.1:5100"),
            None,
        ));
        for kind in [PacketKind::Stop, PacketKind::StopAck, PacketKind::Leave, PacketKind::LeaveAck] {
            round_trip(Packet::empty(kind, ep("127.0.0.1:5100"), None));
        }
    }

    #[test]
    fn preserves_aid_and_float_payloads_exactly() {
        let alloc = Allocation::new(u64::MAX, f64::MIN_POSITIVE, -0.0, 1e300);
        let packet = Packet::new(
            PacketKind::Allocation,
            Payload::Allocation(alloc),
            ep("10.0.0.1:65535"),
            None,
        );
        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        match decoded.payload {
            Payload::Allocation(a) => {
                assert_eq!(a.aid, u64::MAX);
                assert_eq!(a.p.to_bits(), f64::MIN_POSITIVE.to_bits());
                assert_eq!(a.q.to_bits(), (-0.0f64).to_bits());
                assert_eq!(a.duration, 1e300);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut inner = Vec::new();
        encode::write_array_len(&mut inner, 4).unwrap();
        encode::write_str(&mut inner, "jon").unwrap();
        encode::write_nil(&mut inner).unwrap();
        encode::write_str(&mut inner, "127.0.0.1:5100").unwrap();
        encode::write_nil(&mut inner).unwrap();
        let mut frame = Vec::new();
        encode::write_ext_meta(&mut frame, inner.len() as u32, EXT_PACKET).unwrap();
        frame.extend_from_slice(&inner);

        assert!(matches!(decode(&frame), Err(CodecError::UnknownKind(k)) if k == "jon"));
    }

    #[test]
    fn rejects_payload_on_control_kind() {
        let mut inner = Vec::new();
        encode::write_array_len(&mut inner, 4).unwrap();
        encode::write_str(&mut inner, "stop").unwrap();
        write_allocation(&mut inner, &Allocation::default()).unwrap();
        encode::write_str(&mut inner, "127.0.0.1:5100").unwrap();
        encode::write_nil(&mut inner).unwrap();
        let mut frame = Vec::new();
        encode::write_ext_meta(&mut frame, inner.len() as u32, EXT_PACKET).unwrap();
        frame.extend_from_slice(&inner);

        assert!(matches!(decode(&frame), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn rejects_wrong_outer_tag() {
        let mut inner = Vec::new();
        encode::write_array_len(&mut inner, 4).unwrap();
        encode::write_str(&mut inner, "stop").unwrap();
        encode::write_nil(&mut inner).unwrap();
        encode::write_str(&mut inner, "127.0.0.1:5100").unwrap();
        encode::write_nil(&mut inner).unwrap();
        let mut frame = Vec::new();
        encode::write_ext_meta(&mut frame, inner.len() as u32, 9).unwrap();
        frame.extend_from_slice(&inner);

        assert!(matches!(decode(&frame), Err(CodecError::UnexpectedTag(9))));
    }

    #[test]
    fn rejects_truncated_frames() {
        let packet = Packet::new(
            PacketKind::Allocation,
            Payload::Allocation(Allocation::new(1, 2.0, 3.0, 4.0)),
            ep("127.0.0.1:5000"),
            Some(ep("127.0.0.1:5100")),
        );
        let frame = encode(&packet).unwrap();
        for cut in [1, frame.len() / 2, frame.len() - 1] {
            assert!(decode(&frame[..cut]).is_err());
        }
    }

    #[test]
    fn encode_refuses_invalid_packets() {
        let packet = Packet::new(
            PacketKind::StopAck,
            Payload::Allocation(Allocation::default()),
            ep("127.0.0.1:5100"),
            None,
        );
        assert!(matches!(encode(&packet), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn garbage_never_panics() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xc1]).is_err());
        assert!(decode(&[0xd4, 0x01]).is_err());
        let noise: Vec<u8> = (0..=255).collect();
        assert!(decode(&noise).is_err());
    }
}
