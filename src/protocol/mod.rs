//! Protocol module - wire format, packet framing, and message records.
//!
//! This module implements the byte-level protocol of the serial link:
//! - Byte stuffing and checksum ([`escape`], [`unescape`], [`checksum`])
//! - Packet framing with a 4-bit sequence header ([`wrap`], [`unwrap`])
//! - ACK/NAK signals ([`ack_or_nak`], [`nak_with_status`])
//! - Frame buffer for reassembling packets from partial reads
//! - [`WireMessage`] serialization inside a packet payload

mod frame_buffer;
mod message;
mod packet;
mod wire_format;

pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};
pub use message::{Attributes, Category, MessageType, WireMessage, MESSAGE_HEADER_SIZE};
pub use packet::{ack_or_nak, frame, nak_with_status, unwrap, wrap, Packet, MAX_PAYLOAD_SIZE};
pub use wire_format::{
    byte_sum, checksum, escape, needs_escape, packet_type, unescape, ESCAPE_BYTE, HEADER_SIZE,
    LEGACY_SIGNAL_SIZE, SEQ_BITS, SEQ_MASK, SEQ_MODULUS, SIGNAL_SIZE, START_BYTE, STOP_BYTE,
    TYPE_MASK,
};
