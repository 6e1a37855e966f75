//! WireMessage: the serialized record carried in a data packet payload.
//!
//! Layout (all little-endian):
//! ```text
//! ┌────────┬──────┬──────┬───────────────┬────────────┬──────┬───────┬──────────┬──────┐
//! │ msg_id │ from │  to  │ response_code │ msg_status │ type │ attrs │ format\0 │ data │
//! │  u16   │ u16  │ u16  │     u16       │    u16     │  u8  │  u8   │  string  │      │
//! └────────┴──────┴──────┴───────────────┴────────────┴──────┴───────┴──────────┴──────┘
//! ```
//!
//! The type byte packs `category << 6 | subtype << 4 | option`:
//!
//! | category       | subtype       | options                           |
//! |----------------|---------------|-----------------------------------|
//! | Order (0)      | Command (0)   | Normal, Special                   |
//! | Order (0)      | Property (1)  | Get, Set, Stream On, Stream Off   |
//! | Response (1)   | Command (0)   | Complete, In Progress             |
//! | Response (1)   | Property (1)  | Get, Set, Stream Value            |
//! | Notification(2)| Direct (0)    | Event                             |
//! | Notification(2)| Broadcast (1) | Internal, External                |

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{self, Value};
use crate::error::{PcomError, Result};

/// Fixed header size before the format string.
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Message category (top two bits of the type byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Order,
    OrderResponse,
    Notification,
}

/// Every defined combination of category, subtype and option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command,
    CommandSpecial,
    PropertyGet,
    PropertySet,
    StreamOn,
    StreamOff,
    CommandComplete,
    CommandInProgress,
    PropertyGetResponse,
    PropertySetResponse,
    StreamValue,
    Event,
    BroadcastInternal,
    BroadcastExternal,
}

impl MessageType {
    const ALL: [MessageType; 14] = [
        Self::Command,
        Self::CommandSpecial,
        Self::PropertyGet,
        Self::PropertySet,
        Self::StreamOn,
        Self::StreamOff,
        Self::CommandComplete,
        Self::CommandInProgress,
        Self::PropertyGetResponse,
        Self::PropertySetResponse,
        Self::StreamValue,
        Self::Event,
        Self::BroadcastInternal,
        Self::BroadcastExternal,
    ];

    /// Encoded type byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Command => 0x00,
            Self::CommandSpecial => 0x01,
            Self::PropertyGet => 0x10,
            Self::PropertySet => 0x11,
            Self::StreamOn => 0x12,
            Self::StreamOff => 0x13,
            Self::CommandComplete => 0x40,
            Self::CommandInProgress => 0x41,
            Self::PropertyGetResponse => 0x50,
            Self::PropertySetResponse => 0x51,
            Self::StreamValue => 0x52,
            Self::Event => 0x80,
            Self::BroadcastInternal => 0x90,
            Self::BroadcastExternal => 0x91,
        }
    }

    /// Decode a type byte, `None` for undefined combinations.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_byte() == byte)
    }

    pub fn category(self) -> Category {
        match self.as_byte() >> 6 {
            0 => Category::Order,
            1 => Category::OrderResponse,
            _ => Category::Notification,
        }
    }

    pub fn subtype(self) -> u8 {
        (self.as_byte() >> 4) & 0x03
    }

    pub fn option(self) -> u8 {
        self.as_byte() & 0x0F
    }

    /// Whether `response_code` holds a property or stream id.
    pub fn is_property(self) -> bool {
        self.category() != Category::Notification && self.subtype() == 1
    }
}

/// Attribute bits of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    pub high_priority: bool,
    pub response_required: bool,
}

impl Attributes {
    const PRIORITY: u8 = 0x01;
    const RESPONSE_REQUIRED: u8 = 0x02;

    pub fn as_byte(self) -> u8 {
        let mut byte = 0;
        if self.high_priority {
            byte |= Self::PRIORITY;
        }
        if self.response_required {
            byte |= Self::RESPONSE_REQUIRED;
        }
        byte
    }

    /// Decode attribute bits; unknown bits are ignored.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            high_priority: byte & Self::PRIORITY != 0,
            response_required: byte & Self::RESPONSE_REQUIRED != 0,
        }
    }
}

/// The canonical on-link record.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub msg_id: u16,
    pub from: u16,
    pub to: u16,
    /// Command, property or stream id for orders and responses; event code
    /// for notifications.
    pub response_code: u16,
    pub msg_status: u16,
    pub message_type: MessageType,
    pub attributes: Attributes,
    pub format: String,
    pub data: Vec<Value>,
}

impl WireMessage {
    /// Serialize to a packet payload.
    ///
    /// # Errors
    ///
    /// [`PcomError::Encoding`] if the format contains a NUL or the data does
    /// not fit the format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.format.contains('\0') {
            return Err(PcomError::Encoding("format string contains a NUL byte".to_string()));
        }
        let data = codec::encode(&self.format, &self.data)?;

        let mut buf =
            BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.format.len() + 1 + data.len());
        buf.put_u16_le(self.msg_id);
        buf.put_u16_le(self.from);
        buf.put_u16_le(self.to);
        buf.put_u16_le(self.response_code);
        buf.put_u16_le(self.msg_status);
        buf.put_u8(self.message_type.as_byte());
        buf.put_u8(self.attributes.as_byte());
        buf.put_slice(self.format.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&data);
        Ok(buf.to_vec())
    }

    /// Parse a packet payload.
    ///
    /// # Errors
    ///
    /// [`PcomError::Decoding`] on a short header, an undefined type byte, a
    /// missing format terminator or data that does not match the format.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return Err(PcomError::Decoding(format!(
                "message of {} bytes is shorter than its {MESSAGE_HEADER_SIZE}-byte header",
                payload.len()
            )));
        }

        let mut cursor = payload;
        let msg_id = cursor.get_u16_le();
        let from = cursor.get_u16_le();
        let to = cursor.get_u16_le();
        let response_code = cursor.get_u16_le();
        let msg_status = cursor.get_u16_le();
        let type_byte = cursor.get_u8();
        let attributes = Attributes::from_byte(cursor.get_u8());

        let message_type = MessageType::from_byte(type_byte).ok_or_else(|| {
            PcomError::Decoding(format!("undefined message type {type_byte:#04x}"))
        })?;

        let end = cursor
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PcomError::Decoding("format string is not terminated".to_string()))?;
        let format = std::str::from_utf8(&cursor[..end])
            .map_err(|e| PcomError::Decoding(format!("format string is not UTF-8: {e}")))?
            .to_string();
        let data = codec::decode(&format, &cursor[end + 1..])?;

        Ok(Self {
            msg_id,
            from,
            to,
            response_code,
            msg_status,
            message_type,
            attributes,
            format,
            data,
        })
    }
}
