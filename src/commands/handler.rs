//! Request Dispatch
//!
//! The handler takes one complete request sitting at the start of a
//! session buffer, runs it, and overwrites the same buffer with the
//! response. The `id` field is never written.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────┐     │
//! │  │   parse()   │───>│  dispatch() │───>│ in-place rsp │     │
//! │  └─────────────┘    └──────┬──────┘    └──────────────┘     │
//! │                            │                                │
//! │              ┌─────────────┴─────────────┐                  │
//! │              ▼                           ▼                  │
//! │           Engine                  ListenerControl           │
//! │  GET SET ADD REPLACE DELETE      CONFIG DECONFIG            │
//! │  SHRINK                                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Responses
//!
//! - `GET` hit: `ACK`, `key_len` kept, key echoed, then the value bytes read
//!   (bounded by the requested capacity). An empty value is a bare `ACK`.
//! - Everything else: a bare `ACK` or `NACK` header with zero lengths.

use crate::connection::ServerError;
use crate::protocol::{parse_request, Command, PacketHeader, Request, HEADER_LEN};
use crate::storage::error::to_signed;
use crate::storage::{engine_shrink, Engine, StoreError};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Starts and stops the network listener on behalf of `CONFIG`/`DECONFIG`.
pub trait ListenerControl: Send + Sync {
    /// Starts listening on `addr`. Returns the bound address.
    fn configure(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError>;

    /// Stops listening. Returns whether a listener was running.
    fn deconfigure(&self) -> bool;
}

/// Outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Non-negative on success (bytes read for `GET`), negative error code otherwise
    pub code: isize,
    /// Bytes of response at the start of the buffer
    pub len: usize,
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        self.code >= 0
    }
}

/// Executes requests against the engine and the listener.
#[derive(Clone)]
pub struct CommandHandler {
    engine: Arc<Engine>,
    control: Option<Weak<dyn ListenerControl>>,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("engine", &self.engine)
            .field("control", &self.control.is_some())
            .finish()
    }
}

fn ack(buf: &mut [u8], code: isize) -> Reply {
    PacketHeader::write_response(buf, Command::Ack.code(), 0, 0);
    Reply {
        code,
        len: HEADER_LEN,
    }
}

fn nack(buf: &mut [u8], code: isize) -> Reply {
    PacketHeader::write_response(buf, Command::Nack.code(), 0, 0);
    Reply {
        code,
        len: HEADER_LEN,
    }
}

fn invalid(reason: &str) -> isize {
    StoreError::InvalidRequest(reason.to_string()).errno() as isize
}

impl CommandHandler {
    /// Creates a handler without listener control; `CONFIG` and
    /// `DECONFIG` are refused.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            control: None,
        }
    }

    /// Creates a handler that forwards listener commands to `control`.
    pub fn with_control(engine: Arc<Engine>, control: Weak<dyn ListenerControl>) -> Self {
        Self {
            engine,
            control: Some(control),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Processes the request in `buf[..frame]` and writes the response to
    /// the start of `buf`.
    pub fn process(&self, buf: &mut [u8], frame: usize) -> Reply {
        let request = match parse_request(buf, frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejected request");
                return nack(buf, invalid(&e.to_string()));
            }
        };
        trace!(id = request.id, command = %request.command, "Processing request");

        if request.command == Command::Get {
            return self.cmd_get(buf, &request);
        }

        let code = self.dispatch(buf, &request);
        if code < 0 {
            nack(buf, code)
        } else {
            ack(buf, code)
        }
    }

    fn dispatch(&self, buf: &[u8], request: &Request) -> isize {
        let key = &buf[request.key.clone()];
        let value = &buf[request.value.clone()];

        match request.command {
            Command::Config => self.cmd_config(value),
            Command::Deconfig => self.cmd_deconfig(),
            Command::Set => to_signed(self.engine.set(key, value)),
            Command::Add => to_signed(self.engine.add(key, value)),
            Command::Replace => to_signed(self.engine.replace(key, value)),
            Command::Delete => to_signed(self.engine.delete(key)),
            Command::Shrink => engine_shrink(&self.engine),
            Command::Get | Command::Ack | Command::Nack => invalid("not a dispatchable command"),
        }
    }

    fn cmd_get(&self, buf: &mut [u8], request: &Request) -> Reply {
        let (head, tail) = buf.split_at_mut(request.key.end);
        let key = &head[request.key.clone()];
        let value = &mut tail[..request.value.len()];

        match self.engine.get(key, value) {
            Ok(0) => ack(buf, 0),
            Ok(n) => {
                PacketHeader::write_response(
                    buf,
                    Command::Ack.code(),
                    request.key.len() as u32,
                    n as u32,
                );
                Reply {
                    code: n as isize,
                    len: request.key.end + n,
                }
            }
            Err(e) => nack(buf, e.errno() as isize),
        }
    }

    fn cmd_config(&self, value: &[u8]) -> isize {
        let Some(control) = self.control.as_ref().and_then(Weak::upgrade) else {
            warn!("CONFIG received but listener control is unavailable");
            return invalid("no listener control");
        };

        let addr = std::str::from_utf8(value)
            .ok()
            .map(|text| text.trim_end_matches(['\0', '\r', '\n', ' ']))
            .and_then(|text| text.parse::<SocketAddr>().ok());
        let Some(addr) = addr else {
            return ServerError::InvalidAddress(String::from_utf8_lossy(value).into_owned()).errno()
                as isize;
        };

        match control.configure(addr) {
            Ok(bound) => {
                info!(addr = %bound, "Listener configured");
                0
            }
            Err(e) => {
                warn!(error = %e, "CONFIG failed");
                e.errno() as isize
            }
        }
    }

    fn cmd_deconfig(&self) -> isize {
        match self.control.as_ref().and_then(Weak::upgrade) {
            Some(control) => {
                if control.deconfigure() {
                    info!("Listener deconfigured");
                }
                0
            }
            None => invalid("no listener control"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_get, encode_request, frame_len, parse_response, Response};
    use crate::storage::error::{EEXIST, EINVAL, ENOENT};
    use bytes::Bytes;
    use parking_lot::Mutex;

    const BUF: usize = 256;

    fn create_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(Engine::new()))
    }

    fn run(handler: &CommandHandler, packet: &[u8]) -> (Reply, Response) {
        let mut buf = vec![0u8; BUF];
        buf[..packet.len()].copy_from_slice(packet);
        let frame = frame_len(&buf[..packet.len()], BUF).unwrap().unwrap();

        let reply = handler.process(&mut buf, frame);
        let (response, used) = parse_response(&buf[..reply.len]).unwrap().unwrap();
        assert_eq!(used, reply.len);
        (reply, response)
    }

    #[derive(Default)]
    struct FakeListener {
        bound: Mutex<Option<SocketAddr>>,
    }

    impl ListenerControl for FakeListener {
        fn configure(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
            let mut bound = self.bound.lock();
            if let Some(current) = *bound {
                return Err(ServerError::AlreadyListening(current));
            }
            *bound = Some(addr);
            Ok(addr)
        }

        fn deconfigure(&self) -> bool {
            self.bound.lock().take().is_some()
        }
    }

    #[test]
    fn test_set_get() {
        let handler = create_handler();

        let (reply, response) = run(&handler, &encode_request(1, Command::Set, b"a", b"hello"));
        assert_eq!(reply.code, 0);
        assert!(response.is_ack());
        assert!(response.key.is_empty() && response.value.is_empty());

        let (reply, response) = run(&handler, &encode_get(2, b"a", 0));
        assert_eq!(reply.code, 5);
        assert_eq!(response.id, 2);
        assert!(response.is_ack());
        assert_eq!(response.key, Bytes::from("a"));
        assert_eq!(response.value, Bytes::from("hello"));
    }

    #[test]
    fn test_get_nonexistent() {
        let handler = create_handler();
        let (reply, response) = run(&handler, &encode_get(3, b"missing", 0));

        assert_eq!(reply.code, -(ENOENT as isize));
        assert_eq!(response.command, Command::Nack);
        assert_eq!(response.id, 3);
        assert_eq!(reply.len, HEADER_LEN);
    }

    #[test]
    fn test_get_respects_capacity() {
        let handler = create_handler();
        run(&handler, &encode_request(1, Command::Set, b"k", b"hello world"));

        let (reply, response) = run(&handler, &encode_get(2, b"k", 5));
        assert_eq!(reply.code, 5);
        assert_eq!(response.value, Bytes::from("hello"));
    }

    #[test]
    fn test_get_empty_value() {
        let handler = create_handler();
        let mut set = encode_request(1, Command::Set, b"k", b"").to_vec();
        // Declared length zero with nothing after the key: an empty value.
        set.truncate(HEADER_LEN + 1);
        run(&handler, &set);

        let (reply, response) = run(&handler, &encode_get(2, b"k", 0));
        assert_eq!(reply.code, 0);
        assert!(response.is_ack());
        assert!(response.key.is_empty());
        assert!(response.value.is_empty());
    }

    #[test]
    fn test_end_to_end_sequence() {
        let handler = create_handler();

        let (reply, _) = run(&handler, &encode_request(1, Command::Set, b"a", b"hello"));
        assert_eq!(reply.code, 0);

        let (_, response) = run(&handler, &encode_get(2, b"a", 0));
        assert_eq!(response.value, Bytes::from("hello"));

        let (reply, response) = run(&handler, &encode_request(3, Command::Add, b"a", b"x"));
        assert_eq!(reply.code, -(EEXIST as isize));
        assert_eq!(response.command, Command::Nack);

        let (reply, _) = run(&handler, &encode_request(4, Command::Replace, b"b", b"y"));
        assert_eq!(reply.code, -(ENOENT as isize));

        let (reply, response) = run(&handler, &encode_request(5, Command::Delete, b"a", b""));
        assert_eq!(reply.code, 0);
        assert!(response.is_ack());

        let (reply, _) = run(&handler, &encode_get(6, b"a", 0));
        assert_eq!(reply.code, -(ENOENT as isize));

        let (reply, response) = run(&handler, &encode_request(7, Command::Shrink, b"", b""));
        assert_eq!(reply.code, 0);
        assert!(response.is_ack());
        assert_eq!(handler.engine().retired(), 0);
    }

    #[test]
    fn test_response_keeps_id() {
        let handler = create_handler();
        for packet in [
            encode_request(7, Command::Set, b"k", b"v"),
            encode_get(7, b"k", 0),
            encode_get(7, b"missing", 0),
            encode_request(7, Command::Delete, b"missing", b""),
        ] {
            let (_, response) = run(&handler, &packet);
            assert_eq!(response.id, 7);
        }
    }

    #[test]
    fn test_malformed_requests_are_nacked() {
        let handler = create_handler();

        let mut unknown = encode_request(1, Command::Set, b"k", b"v").to_vec();
        unknown[4] = 42;
        let (reply, response) = run(&handler, &unknown);
        assert_eq!(reply.code, -(EINVAL as isize));
        assert_eq!(response.command, Command::Nack);

        let (reply, _) = run(&handler, &encode_request(2, Command::Nack, b"k", b""));
        assert_eq!(reply.code, -(EINVAL as isize));

        let (reply, _) = run(&handler, &encode_request(3, Command::Set, b"", b"v"));
        assert_eq!(reply.code, -(EINVAL as isize));
    }

    #[test]
    fn test_config_without_control() {
        let handler = create_handler();
        let (reply, response) = run(
            &handler,
            &encode_request(1, Command::Config, b"", b"127.0.0.1:0"),
        );
        assert_eq!(response.command, Command::Nack);
        assert_eq!(reply.code, -(EINVAL as isize));
    }

    #[test]
    fn test_config_and_deconfig() {
        let listener: Arc<dyn ListenerControl> = Arc::new(FakeListener::default());
        let handler =
            CommandHandler::with_control(Arc::new(Engine::new()), Arc::downgrade(&listener));

        let (reply, _) = run(
            &handler,
            &encode_request(1, Command::Config, b"", b"127.0.0.1:7370\0"),
        );
        assert_eq!(reply.code, 0);

        let (reply, response) = run(
            &handler,
            &encode_request(2, Command::Config, b"", b"127.0.0.1:7371"),
        );
        assert_eq!(reply.code, -(EEXIST as isize));
        assert_eq!(response.command, Command::Nack);

        let (reply, _) = run(&handler, &encode_request(3, Command::Config, b"", b"nonsense"));
        assert_eq!(reply.code, -(EINVAL as isize));

        let (reply, _) = run(&handler, &encode_request(4, Command::Deconfig, b"", b""));
        assert_eq!(reply.code, 0);
        // Deconfiguring twice still succeeds.
        let (reply, _) = run(&handler, &encode_request(5, Command::Deconfig, b"", b""));
        assert_eq!(reply.code, 0);
    }
}
