//! Batch framing.
//!
//! Packets travel in batches: one batch is one reliable payload, compressed
//! and encrypted as a unit. Inside, each packet is framed as
//!
//! ```text
//! [var-u32 length][var-u32 packet id][body]
//! ```
//!
//! where `length` covers the id and the body. The length prefix lets a broken
//! body be skipped without losing the packets after it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::packet::Packet;
use crate::core::schema::PacketRegistry;
use crate::core::varint;
use crate::error::{constants, ProtocolError, Result};

/// Encode packets into one batch payload
pub fn encode_batch(packets: &[Packet], registry: &PacketRegistry) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(packets.len() * 16);
    for packet in packets {
        let body = packet.encode(registry)?;
        let id = packet.id();
        let len = varint::var_u32_len(id) + body.len();
        let len = u32::try_from(len)
            .map_err(|_| ProtocolError::SchemaError("packet body too large".into()))?;
        varint::write_var_u32(&mut out, len);
        varint::write_var_u32(&mut out, id);
        out.put_slice(&body);
    }
    Ok(out.freeze())
}

/// Decode a batch.
///
/// Each entry is the outcome for one framed packet: a body that fails to decode
/// yields an `Err` for that packet and decoding continues with the next frame.
/// A broken length prefix ends the batch with a final `Err`, since nothing after
/// it can be located.
pub fn decode_batch(
    payload: &[u8],
    registry: &PacketRegistry,
    max_packets: usize,
) -> Vec<Result<Packet>> {
    let mut results = Vec::new();
    let mut buf = payload;

    while !buf.is_empty() {
        if results.len() >= max_packets {
            results.push(Err(ProtocolError::malformed(constants::ERR_TOO_MANY_PACKETS)));
            break;
        }

        let len = match varint::read_var_u32(&mut buf) {
            Ok(len) => len as usize,
            Err(e) => {
                results.push(Err(e));
                break;
            }
        };
        if len > buf.len() || len == 0 {
            results.push(Err(ProtocolError::malformed(constants::ERR_LENGTH_PREFIX)));
            break;
        }

        let (mut entry, rest) = buf.split_at(len);
        buf = rest;

        let outcome = varint::read_var_u32(&mut entry)
            .and_then(|id| Packet::decode(id, entry, registry));
        results.push(outcome);
    }

    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::KeepAlive;
    use crate::core::schema::{FieldKind, FieldValue};

    fn registry() -> PacketRegistry {
        let registry = PacketRegistry::new();
        registry
            .register_schema(0x50, "Note", vec![FieldKind::String])
            .unwrap();
        registry
    }

    #[test]
    fn test_batch_roundtrip() {
        let registry = registry();
        let packets = vec![
            Packet::KeepAlive(KeepAlive {
                ping_id: 1,
                response: false,
            }),
            Packet::game(0x50, vec![FieldValue::String("a".repeat(300))]),
            Packet::SpawnComplete { session_id: 3 },
        ];
        let payload = encode_batch(&packets, &registry).unwrap();
        let decoded: Vec<Packet> = decode_batch(&payload, &registry, 64)
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_bad_body_skipped() {
        let registry = registry();
        let mut payload = BytesMut::new();
        // unknown game id 0x99 with a 1-byte body
        varint::write_var_u32(&mut payload, 3);
        varint::write_var_u32(&mut payload, 0x99);
        payload.put_u8(0);
        let good = encode_batch(&[Packet::SpawnComplete { session_id: 8 }], &registry).unwrap();
        payload.put_slice(&good);

        let results = decode_batch(&payload, &registry, 64);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ProtocolError::MalformedPacket(_))));
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Packet::SpawnComplete { session_id: 8 }
        );
    }

    #[test]
    fn test_length_prefix_overrun_stops() {
        let registry = registry();
        let payload = [0x40u8, 0x08, 0x00];
        let results = decode_batch(&payload, &registry, 64);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_packet_limit() {
        let registry = registry();
        let packets: Vec<Packet> = (0..5)
            .map(|i| Packet::SpawnComplete { session_id: i })
            .collect();
        let payload = encode_batch(&packets, &registry).unwrap();
        let results = decode_batch(&payload, &registry, 3);
        assert_eq!(results.len(), 4);
        assert!(results[3].is_err());
    }
}
