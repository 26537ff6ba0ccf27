//! # Peer Wire Messages
//!
//! Framing and typed identifiers for the BitTorrent peer wire protocol.
//! Every message on the wire is:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), counts ID + payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes
//!
//! A length prefix of 0 is a keep-alive: no ID, no payload.
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | choke | empty |
//! | 1 | unchoke | empty |
//! | 2 | interested | empty |
//! | 3 | not interested | empty |
//! | 4 | have | piece index (u32) |
//! | 5 | bitfield | byte array, one bit per piece |
//! | 6 | request | index, begin, length (3 × u32) |
//! | 7 | piece | index, begin, block bytes |
//! | 8 | cancel | same shape as request |
//! | 9 | port | DHT port (u16) |

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_PORT: MessageId = 9;
/// Internal sentinel for a zero-length frame (never appears on the wire).
pub const MESSAGE_KEEPALIVE: MessageId = 255;

/// Cap on the length prefix. A piece message carries at most one 16 KiB
/// block; anything past this is a malformed or hostile frame and must not
/// drive an allocation.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Wire-log name of a message id.
pub fn message_name(id: MessageId) -> &'static str {
    match id {
        MESSAGE_CHOKE => "choke",
        MESSAGE_UNCHOKE => "unchoke",
        MESSAGE_INTERESTED => "interested",
        MESSAGE_NOT_INTERESTED => "not interested",
        MESSAGE_HAVE => "have",
        MESSAGE_BITFIELD => "bitfield",
        MESSAGE_REQUEST => "request",
        MESSAGE_PIECE => "piece",
        MESSAGE_CANCEL => "cancel",
        MESSAGE_PORT => "port",
        MESSAGE_KEEPALIVE => "keep-alive",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    pub fn keep_alive() -> Self {
        Message::new(MESSAGE_KEEPALIVE)
    }

    /// Serialize to wire format. The keep-alive sentinel serializes to the
    /// bare zero length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = vec![];

        if self.id == MESSAGE_KEEPALIVE {
            buf.write_u32::<BigEndian>(0)?;
            return Ok(buf);
        }

        buf.write_u32::<BigEndian>(1 + self.payload.len() as u32)?;
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }
}

/// Parse the body of a non-empty frame (everything after the length
/// prefix). Unknown ids are returned opaquely; the caller decides what to
/// do with them.
pub fn deserialize_message(body: &[u8]) -> Result<Message> {
    let id = *body
        .first()
        .ok_or_else(|| anyhow!("message frame is missing its id byte"))?;

    Ok(Message::with_payload(id, body[1..].to_vec()))
}

/// Piece availability of a remote peer, one bit per piece.
///
/// Bit layout follows the wire: most significant bit of byte 0 is piece 0.
/// Bits past the torrent's piece count carry no meaning and are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    /// A zeroed bitfield sized for `total_pieces` pieces.
    pub fn zeroed(total_pieces: u32) -> Self {
        Bitfield(vec![0; total_pieces.div_ceil(8) as usize])
    }

    /// Adopt a bitfield payload received from the wire.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Bitfield(payload)
    }

    pub fn has(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.0.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    pub fn set(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if let Some(byte) = self.0.get_mut(byte_index) {
            *byte |= 1 << (7 - offset);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
