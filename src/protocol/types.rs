//! Wire Packet Types
//!
//! Every request and response is one packet: a fixed 16-byte header
//! followed by the key and value bytes. All header fields are
//! little-endian `u32`.
//!
//! ```text
//!  0        4           8           12          16
//!  ┌────────┬───────────┬───────────┬───────────┬─────────────────────┐
//!  │   id   │  command  │  key_len  │ value_len │ key bytes │ value   │
//!  └────────┴───────────┴───────────┴───────────┴─────────────────────┘
//! ```
//!
//! The responder builds its reply in the buffer that held the request and
//! never writes the `id` field, so a response always carries the id of the
//! request it answers.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Size of the fixed packet header
pub const HEADER_LEN: usize = 16;

/// Command codes carried in the header's `command` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Start listening on the address given as the value
    Config = 0,
    /// Stop listening
    Deconfig = 1,
    Get = 10,
    Set = 11,
    Add = 12,
    Replace = 13,
    Delete = 14,
    Shrink = 15,
    /// Success response
    Ack = 20,
    /// Failure response
    Nack = 21,
}

impl Command {
    /// The numeric code on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Commands whose value is taken from the bytes after the key when
    /// `value_len` is zero.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Command::Config | Command::Set | Command::Add | Command::Replace
        )
    }

    pub fn is_response(self) -> bool {
        matches!(self, Command::Ack | Command::Nack)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Config => "CONFIG",
            Command::Deconfig => "DECONFIG",
            Command::Get => "GET",
            Command::Set => "SET",
            Command::Add => "ADD",
            Command::Replace => "REPLACE",
            Command::Delete => "DELETE",
            Command::Shrink => "SHRINK",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Command::Config,
            1 => Command::Deconfig,
            10 => Command::Get,
            11 => Command::Set,
            12 => Command::Add,
            13 => Command::Replace,
            14 => Command::Delete,
            15 => Command::Shrink,
            20 => Command::Ack,
            21 => Command::Nack,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The fixed packet header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u32,
    pub command: u32,
    pub key_len: u32,
    pub value_len: u32,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl PacketHeader {
    /// Decodes the header at the start of `buf`, or `None` if fewer than
    /// [`HEADER_LEN`] bytes are present.
    pub fn read(buf: &[u8]) -> Option<Self> {
        let raw = buf.get(..HEADER_LEN)?;
        Some(Self {
            id: read_u32(raw, 0),
            command: read_u32(raw, 4),
            key_len: read_u32(raw, 8),
            value_len: read_u32(raw, 12),
        })
    }

    /// Writes all four fields to the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        if let Some(raw) = buf.get_mut(..HEADER_LEN) {
            raw[0..4].copy_from_slice(&self.id.to_le_bytes());
            Self::write_response(raw, self.command, self.key_len, self.value_len);
        }
    }

    /// Overwrites every field except `id`.
    pub fn write_response(buf: &mut [u8], command: u32, key_len: u32, value_len: u32) {
        if let Some(raw) = buf.get_mut(4..HEADER_LEN) {
            raw[0..4].copy_from_slice(&command.to_le_bytes());
            raw[4..8].copy_from_slice(&key_len.to_le_bytes());
            raw[8..12].copy_from_slice(&value_len.to_le_bytes());
        }
    }

    /// The decoded command, or the raw code if it is unknown.
    pub fn command(&self) -> Result<Command, u32> {
        Command::try_from(self.command)
    }

    /// Header plus key plus value, as declared.
    pub fn packet_len(&self) -> usize {
        HEADER_LEN + self.key_len as usize + self.value_len as usize
    }
}

/// Encodes a request packet.
///
/// # Example
///
/// ```
/// use kkv::protocol::{encode_request, Command, PacketHeader};
///
/// let packet = encode_request(7, Command::Set, b"a", b"hello");
/// let header = PacketHeader::read(&packet).unwrap();
/// assert_eq!(header.id, 7);
/// assert_eq!(header.packet_len(), packet.len());
/// ```
pub fn encode_request(id: u32, command: Command, key: &[u8], value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + key.len() + value.len());
    buf.put_u32_le(id);
    buf.put_u32_le(command.code());
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);
    buf
}

/// Encodes a `GET` asking for at most `capacity` value bytes (zero means
/// as much as the server's buffer holds). No value bytes are sent.
pub fn encode_get(id: u32, key: &[u8], capacity: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + key.len());
    buf.put_u32_le(id);
    buf.put_u32_le(Command::Get.code());
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(capacity);
    buf.put_slice(key);
    buf
}
