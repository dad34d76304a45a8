//! Request Framing and Parsing
//!
//! Bytes arrive from a socket in arbitrary pieces. The session keeps them
//! in a fixed buffer and asks [`frame_len`] whether a whole request has
//! arrived:
//!
//! - `Ok(Some(len))` - the first `len` bytes form one request
//! - `Ok(None)` - need more data
//! - `Err(ParseError)` - the request can never fit; the client is dropped
//!
//! A request is complete once its header and its declared key and value
//! bytes are present. Two commands frame differently:
//!
//! - `GET` sends no value; its `value_len` is the capacity the client
//!   wants back, so only the key is awaited.
//! - A write-class command (`SET`, `ADD`, `REPLACE`, `CONFIG`) with
//!   `value_len == 0` takes every byte received after the key as its value.
//!
//! [`parse_request`] then turns a complete frame into ranges over the
//! session buffer, so the dispatcher can work on the bytes in place.

use crate::protocol::types::{Command, PacketHeader, HEADER_LEN};
use bytes::Bytes;
use std::ops::Range;
use thiserror::Error;

/// Errors that can occur while framing or parsing a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than [`HEADER_LEN`] bytes
    #[error("incomplete header: {0} bytes")]
    ShortHeader(usize),

    /// The command code is not one of the known commands
    #[error("unknown command: {0}")]
    UnknownCommand(u32),

    /// A response code was sent as a request
    #[error("unexpected command in request: {0}")]
    UnexpectedCommand(Command),

    /// The declared key does not fit in the frame
    #[error("key length {key_len} exceeds frame of {frame} bytes")]
    KeyOutOfBounds { key_len: usize, frame: usize },

    /// The declared value does not fit in the frame
    #[error("value length {value_len} exceeds frame of {frame} bytes")]
    ValueOutOfBounds { value_len: usize, frame: usize },

    /// The packet is larger than the receive buffer
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// A parsed request. Key and value are ranges into the buffer that held it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub command: Command,
    pub key: Range<usize>,
    /// For `GET`, the region the value will be read into
    pub value: Range<usize>,
}

/// Returns the length of the first complete request in `received`, given a
/// buffer that can hold at most `max` bytes.
pub fn frame_len(received: &[u8], max: usize) -> ParseResult<Option<usize>> {
    let Some(header) = PacketHeader::read(received) else {
        return Ok(None);
    };

    let keyed = HEADER_LEN + header.key_len as usize;
    let size = match header.command() {
        Ok(Command::Get) => keyed,
        Ok(command) if command.is_write() && header.value_len == 0 => {
            keyed.max(received.len())
        }
        _ => header.packet_len(),
    };

    if size > max {
        return Err(ParseError::MessageTooLarge { size, max });
    }
    if received.len() < size {
        return Ok(None);
    }
    Ok(Some(size))
}

/// Parses one complete request occupying `buf[..frame]`. `buf` is the whole
/// session buffer; a `GET` value region may extend past the frame.
pub fn parse_request(buf: &[u8], frame: usize) -> ParseResult<Request> {
    let header = PacketHeader::read(&buf[..frame.min(buf.len())])
        .ok_or(ParseError::ShortHeader(frame))?;
    let command = header
        .command()
        .map_err(ParseError::UnknownCommand)?;
    if command.is_response() {
        return Err(ParseError::UnexpectedCommand(command));
    }

    let key_len = header.key_len as usize;
    let key = HEADER_LEN..HEADER_LEN + key_len;
    if key.end > frame {
        return Err(ParseError::KeyOutOfBounds { key_len, frame });
    }

    let value_len = header.value_len as usize;
    let value = match command {
        Command::Get => {
            let room = buf.len().saturating_sub(key.end);
            let want = if value_len == 0 { room } else { value_len.min(room) };
            key.end..key.end + want
        }
        _ if command.is_write() && value_len == 0 => key.end..frame,
        _ => {
            let end = key.end + value_len;
            if end > frame {
                return Err(ParseError::ValueOutOfBounds { value_len, frame });
            }
            key.end..end
        }
    };

    Ok(Request {
        id: header.id,
        command,
        key,
        value,
    })
}

/// A decoded response, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    pub command: Command,
    /// Key echoed by a successful `GET`
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    pub fn is_ack(&self) -> bool {
        self.command == Command::Ack
    }
}

/// Decodes one response from the start of `buf`.
///
/// Returns the response and the number of bytes it used, or `None` if the
/// response is not complete yet.
pub fn parse_response(buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
    let Some(header) = PacketHeader::read(buf) else {
        return Ok(None);
    };
    let command = header
        .command()
        .map_err(ParseError::UnknownCommand)?;

    let len = header.packet_len();
    if buf.len() < len {
        return Ok(None);
    }

    let key_end = HEADER_LEN + header.key_len as usize;
    Ok(Some((
        Response {
            id: header.id,
            command,
            key: Bytes::copy_from_slice(&buf[HEADER_LEN..key_end]),
            value: Bytes::copy_from_slice(&buf[key_end..len]),
        },
        len,
    )))
}
