//! Binary Wire Protocol
//!
//! Fixed 16-byte header, then key and value bytes. Requests are parsed
//! and responses built in the same buffer.
//!
//! ## Modules
//!
//! - `types`: command codes, the packet header, request encoding
//! - `parser`: framing of received bytes, request and response parsing
//!
//! ## Example
//!
//! ```
//! use kkv::protocol::{encode_request, frame_len, parse_request, Command};
//!
//! let packet = encode_request(7, Command::Set, b"a", b"hello");
//! let len = frame_len(&packet, 4096).unwrap().unwrap();
//! let request = parse_request(&packet, len).unwrap();
//!
//! assert_eq!(request.id, 7);
//! assert_eq!(&packet[request.value], b"hello");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{frame_len, parse_request, parse_response, ParseError, ParseResult, Request, Response};
pub use types::{encode_get, encode_request, Command, PacketHeader, HEADER_LEN};
