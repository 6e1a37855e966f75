//! Wire format constants, byte stuffing and checksum.
//!
//! A packet on the line:
//! ```text
//! ┌───────┬──────────────────────────────────────────────────┬──────┐
//! │ START │ escaped body                                     │ STOP │
//! │ 0x02  │ seq|type (1) │ checksum (1) │ len LE (2) │ payload │ 0x03 │
//! └───────┴──────────────────────────────────────────────────┴──────┘
//! ```
//!
//! ACK/NAK signals carry a 3-byte body `seq|type, status, checksum`.
//! Every de-escaped body sums to zero mod 256.
//!
//! Inside the body, START, STOP and ESCAPE are written as ESCAPE followed by
//! the byte plus `0x10`. This offset is a compatibility quirk of the deployed
//! devices; keep it bit-exact.

use crate::error::{PcomError, Result};

/// Start-of-packet delimiter.
pub const START_BYTE: u8 = 0x02;

/// End-of-packet delimiter.
pub const STOP_BYTE: u8 = 0x03;

/// Escape marker; also the offset added to an escaped byte.
pub const ESCAPE_BYTE: u8 = 0x10;

/// Width of the sequence number in bits.
pub const SEQ_BITS: u8 = 4;

/// Number of distinct sequence numbers.
pub const SEQ_MODULUS: u8 = 1 << SEQ_BITS;

/// Mask selecting the sequence number in the first header byte.
pub const SEQ_MASK: u8 = SEQ_MODULUS - 1;

/// Mask selecting the packet type in the first header byte.
pub const TYPE_MASK: u8 = !SEQ_MASK;

/// De-escaped header size of a data packet.
pub const HEADER_SIZE: usize = 4;

/// De-escaped body size of an ACK/NAK signal.
pub const SIGNAL_SIZE: usize = 3;

/// De-escaped body size of the legacy ACK/NAK signal.
pub const LEGACY_SIGNAL_SIZE: usize = 4;

/// Packet type values (upper nibble of the first header byte).
pub mod packet_type {
    /// Positive acknowledgement.
    pub const ACK: u8 = 0x20;
    /// Negative acknowledgement.
    pub const NAK: u8 = 0x30;
    /// Data packet, no acknowledgement expected.
    pub const NO_ACK_REQ: u8 = 0x40;
    /// Data packet, receiver must acknowledge.
    pub const ACK_REQ: u8 = 0x80;

    /// Whether the type denotes an ACK or NAK signal.
    #[inline]
    pub fn is_signal(kind: u8) -> bool {
        kind == ACK || kind == NAK
    }
}

/// Whether a byte must be escaped inside a packet body.
#[inline]
pub fn needs_escape(b: u8) -> bool {
    b == START_BYTE || b == STOP_BYTE || b == ESCAPE_BYTE
}

/// Byte-stuff a packet body.
///
/// # Example
///
/// ```
/// use pcom_link::protocol::escape;
///
/// assert_eq!(escape(&[0x01, 0x02, 0x10]), [0x01, 0x10, 0x12, 0x10, 0x20]);
/// ```
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 8 + 1);
    for &b in body {
        if needs_escape(b) {
            out.push(ESCAPE_BYTE);
            out.push(b.wrapping_add(ESCAPE_BYTE));
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverse [`escape`].
///
/// # Errors
///
/// Returns [`PcomError::Framing`] if the input ends with a lone escape
/// marker.
pub fn unescape(escaped: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE_BYTE {
            let &next = bytes
                .next()
                .ok_or_else(|| PcomError::Framing("escape marker at end of packet".to_string()))?;
            out.push(next.wrapping_sub(ESCAPE_BYTE));
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Sum of bytes mod 256.
#[inline]
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Checksum byte making `bytes` plus the checksum sum to zero mod 256.
///
/// # Example
///
/// ```
/// use pcom_link::protocol::checksum;
///
/// assert_eq!(checksum(&[0x80, 0x00, 0x00]), 0x80);
/// assert_eq!(checksum(&[0x81, 0x01, 0x00, 0x33]), 0x4B);
/// ```
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(byte_sum(bytes))
}
