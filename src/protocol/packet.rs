//! Packet framing: sequence header, checksum, byte stuffing, delimiters.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    byte_sum, checksum, escape, packet_type, unescape, HEADER_SIZE, LEGACY_SIGNAL_SIZE, SEQ_MASK,
    SIGNAL_SIZE, START_BYTE, STOP_BYTE, TYPE_MASK,
};
use crate::error::{PcomError, Result};

/// Largest payload a single packet can carry (16-bit length field).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// A parsed inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Peer acknowledged `sequence`.
    Ack { sequence: u8 },
    /// Peer rejected `sequence`.
    Nak { sequence: u8, status: u8 },
    /// A data packet carrying a serialized message.
    Data {
        sequence: u8,
        ack_required: bool,
        payload: Bytes,
    },
}

impl Packet {
    /// Sequence number carried by the packet.
    pub fn sequence(&self) -> u8 {
        match self {
            Packet::Ack { sequence }
            | Packet::Nak { sequence, .. }
            | Packet::Data { sequence, .. } => *sequence,
        }
    }

    /// Whether this is an ACK or NAK signal.
    pub fn is_signal(&self) -> bool {
        !matches!(self, Packet::Data { .. })
    }
}

/// Build a framed data packet.
///
/// Only the low [`SEQ_BITS`](super::SEQ_BITS) of `sequence` are used.
///
/// # Example
///
/// ```
/// use pcom_link::protocol::wrap;
///
/// let packet = wrap(b"", 0, true).unwrap();
/// assert_eq!(&packet[..], b"\x02\x80\x80\x00\x00\x03");
/// ```
///
/// # Errors
///
/// Returns [`PcomError::Framing`] if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn wrap(payload: &[u8], sequence: u8, ack_required: bool) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PcomError::Framing(format!(
            "payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let kind = if ack_required {
        packet_type::ACK_REQ
    } else {
        packet_type::NO_ACK_REQ
    };

    let mut body = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    body.put_u8((sequence & SEQ_MASK) | kind);
    body.put_u8(0);
    body.put_u16_le(payload.len() as u16);
    body.put_slice(payload);
    body[1] = checksum(&body);

    Ok(frame(&body))
}

/// Escape a body and surround it with START/STOP.
pub fn frame(body: &[u8]) -> Bytes {
    let escaped = escape(body);
    let mut out = BytesMut::with_capacity(escaped.len() + 2);
    out.put_u8(START_BYTE);
    out.put_slice(&escaped);
    out.put_u8(STOP_BYTE);
    out.freeze()
}

/// Framed ACK (`is_ack`) or NAK for `sequence`, status 0.
///
/// # Example
///
/// ```
/// use pcom_link::protocol::{ack_or_nak, unwrap, Packet};
///
/// let ack = ack_or_nak(5, true);
/// assert_eq!(unwrap(&ack).unwrap(), Packet::Ack { sequence: 5 });
/// ```
pub fn ack_or_nak(sequence: u8, is_ack: bool) -> Bytes {
    let kind = if is_ack { packet_type::ACK } else { packet_type::NAK };
    frame(&signal_body(sequence, kind, 0))
}

/// Framed NAK for `sequence` carrying a status code.
pub fn nak_with_status(sequence: u8, status: u8) -> Bytes {
    frame(&signal_body(sequence, packet_type::NAK, status))
}

fn signal_body(sequence: u8, kind: u8, status: u8) -> [u8; SIGNAL_SIZE] {
    let first = (sequence & SEQ_MASK) | kind;
    [first, status, checksum(&[first, status])]
}

/// Parse one delimited packet.
///
/// `raw` must start with START and end with STOP. Checks run in order:
/// delimiters, escaping, checksum, then header consistency. A stray
/// delimiter byte inside the packet is left to the checksum, which catches
/// it like any other corrupted byte.
///
/// # Errors
///
/// - [`PcomError::Framing`] for missing outer delimiters, a bad escape,
///   an unknown packet type, or a length field that disagrees with the body
/// - [`PcomError::Checksum`] when the de-escaped body does not sum to zero
pub fn unwrap(raw: &[u8]) -> Result<Packet> {
    let inner = match raw {
        [START_BYTE, inner @ .., STOP_BYTE] => inner,
        _ => {
            return Err(PcomError::Framing(
                "packet is not delimited by START/STOP".to_string(),
            ))
        }
    };
    let body = unescape(inner)?;
    let Some(&first) = body.first() else {
        return Err(PcomError::Framing("empty packet".to_string()));
    };

    let sum = byte_sum(&body);
    if sum != 0 {
        return Err(PcomError::Checksum { sum });
    }

    let sequence = first & SEQ_MASK;
    let kind = first & TYPE_MASK;

    if packet_type::is_signal(kind) {
        let status = match body.len() {
            SIGNAL_SIZE => body[1],
            LEGACY_SIGNAL_SIZE => 0,
            n => {
                return Err(PcomError::Framing(format!("signal body of {n} bytes")));
            }
        };
        return Ok(if kind == packet_type::ACK {
            Packet::Ack { sequence }
        } else {
            Packet::Nak { sequence, status }
        });
    }

    let ack_required = match kind {
        packet_type::ACK_REQ => true,
        packet_type::NO_ACK_REQ => false,
        other => {
            return Err(PcomError::Framing(format!("unknown packet type {other:#04x}")));
        }
    };

    if body.len() < HEADER_SIZE {
        return Err(PcomError::Framing(format!(
            "data packet of {} bytes is shorter than its header",
            body.len()
        )));
    }
    let length = usize::from(u16::from_le_bytes([body[2], body[3]]));
    if body.len() - HEADER_SIZE != length {
        return Err(PcomError::Framing(format!(
            "length field says {length} bytes, body has {}",
            body.len() - HEADER_SIZE
        )));
    }

    Ok(Packet::Data {
        sequence,
        ack_required,
        payload: Bytes::copy_from_slice(&body[HEADER_SIZE..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ESCAPE_BYTE;

    #[test]
    fn test_wrap_empty_payload() {
        let packet = wrap(b"", 0, true).unwrap();
        assert_eq!(&packet[..], [0x02, 0x80, 0x80, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_wrap_single_byte_payload() {
        let packet = wrap(&[0x33], 1, true).unwrap();
        assert_eq!(&packet[..], [0x02, 0x81, 0x4B, 0x01, 0x00, 0x33, 0x03]);
    }

    #[test]
    fn test_wrap_no_ack_type() {
        let packet = wrap(b"", 3, false).unwrap();
        assert_eq!(&packet[..], [0x02, 0x43, 0xBD, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_wrap_masks_sequence() {
        let packet = wrap(b"", 0x12, true).unwrap();
        assert_eq!(packet[1], 0x82);
    }

    #[test]
    fn test_wrap_escapes_payload_and_checksum() {
        let packet = wrap(&[START_BYTE, STOP_BYTE, ESCAPE_BYTE], 0, true).unwrap();
        let inner = &packet[1..packet.len() - 1];
        assert!(!inner.contains(&START_BYTE));
        assert!(!inner.contains(&STOP_BYTE));

        match unwrap(&packet).unwrap() {
            Packet::Data { sequence, ack_required, payload } => {
                assert_eq!(sequence, 0);
                assert!(ack_required);
                assert_eq!(&payload[..], [START_BYTE, STOP_BYTE, ESCAPE_BYTE]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unwrapped_body_sums_to_zero() {
        for seq in 0..16u8 {
            let packet = wrap(b"some payload \x10\x02", seq, seq % 2 == 0).unwrap();
            let body = unescape(&packet[1..packet.len() - 1]).unwrap();
            assert_eq!(byte_sum(&body), 0);
        }
    }

    #[test]
    fn test_single_bit_corruption_detected() {
        let packet = wrap(&[0x00, 0x01, 0x05], 4, true).unwrap();
        let body = unescape(&packet[1..packet.len() - 1]).unwrap();
        for index in 0..body.len() {
            for bit in 0..8 {
                let mut corrupted = body.clone();
                corrupted[index] ^= 1 << bit;
                let err = unwrap(&frame(&corrupted)).unwrap_err();
                assert!(
                    matches!(err, PcomError::Checksum { .. }),
                    "byte {index} bit {bit}: {err:?}"
                );
            }
        }
    }

    #[test]
    fn test_flip_to_delimiter_is_checksum_error() {
        let packet = wrap(&[0x00, 0x01, 0x05], 4, true).unwrap();
        // Payload sits unescaped just before STOP; bit 1 turns 0x00 into
        // START and 0x01 into STOP.
        for index in [packet.len() - 4, packet.len() - 3] {
            let mut corrupted = packet.to_vec();
            corrupted[index] ^= 0x02;
            assert!(matches!(corrupted[index], START_BYTE | STOP_BYTE));
            assert!(
                matches!(unwrap(&corrupted), Err(PcomError::Checksum { .. })),
                "index {index}"
            );
        }
    }

    #[test]
    fn test_checksum_error_reports_sum() {
        let mut packet = wrap(&[0x40], 2, true).unwrap().to_vec();
        packet[5] = 0x41;
        assert!(matches!(unwrap(&packet), Err(PcomError::Checksum { sum: 1 })));
    }

    #[test]
    fn test_missing_delimiters() {
        assert!(matches!(unwrap(&[0x80, 0x80, 0x00, 0x00, 0x03]), Err(PcomError::Framing(_))));
        assert!(matches!(unwrap(&[0x02, 0x80, 0x80, 0x00, 0x00]), Err(PcomError::Framing(_))));
        assert!(matches!(unwrap(&[0x02]), Err(PcomError::Framing(_))));
        assert!(matches!(unwrap(&[0x02, 0x03]), Err(PcomError::Framing(_))));
        assert!(matches!(
            unwrap(&[0x02, 0x80, 0x02, 0x80, 0x00, 0x00, 0x03]),
            Err(PcomError::Checksum { sum: 0x02 })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let body = [0x80, 0x00, 0x02, 0x00, 0x11];
        let mut fixed = body;
        fixed[1] = checksum(&body);
        assert!(matches!(unwrap(&frame(&fixed)), Err(PcomError::Framing(_))));
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut body = [0x55, 0x00, 0x00, 0x00];
        body[1] = checksum(&body);
        assert!(matches!(unwrap(&frame(&body)), Err(PcomError::Framing(_))));
    }

    #[test]
    fn test_ack_and_nak_signals() {
        let ack = ack_or_nak(7, true);
        assert_eq!(unwrap(&ack).unwrap(), Packet::Ack { sequence: 7 });

        let nak = ack_or_nak(7, false);
        assert_eq!(unwrap(&nak).unwrap(), Packet::Nak { sequence: 7, status: 0 });

        let nak = nak_with_status(9, 0x42);
        assert_eq!(unwrap(&nak).unwrap(), Packet::Nak { sequence: 9, status: 0x42 });
    }

    #[test]
    fn test_ack_signal_layout() {
        let ack = ack_or_nak(1, true);
        assert_eq!(&ack[..], [0x02, 0x21, 0x00, 0xDF, 0x03]);
    }

    #[test]
    fn test_legacy_four_byte_ack() {
        let first = packet_type::ACK | 3;
        let body = [first, 0u8.wrapping_sub(first), 0x00, 0x00];
        assert_eq!(unwrap(&frame(&body)).unwrap(), Packet::Ack { sequence: 3 });
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(wrap(&payload, 0, true), Err(PcomError::Framing(_))));
    }

    #[test]
    fn test_packet_accessors() {
        let data = Packet::Data { sequence: 4, ack_required: false, payload: Bytes::new() };
        assert_eq!(data.sequence(), 4);
        assert!(!data.is_signal());
        assert!(Packet::Nak { sequence: 1, status: 0 }.is_signal());
    }
}
