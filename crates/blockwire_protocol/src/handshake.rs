//! Websocket upgrade handshake.
//!
//! A byte-driven state machine over the client's HTTP request. Only the
//! `Sec-WebSocket-Key` header matters; every other line is skipped. The
//! machine consumes bytes up to and including the blank line, so anything
//! the client sent after it stays in the window for the frame decoder.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use blockwire_codec::{BufferPool, Segment, Writer};
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing (RFC 6455).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on the size of the request head.
pub const DEFAULT_HANDSHAKE_LIMIT: usize = 8 * 1024;

const KEY_HEADER: &[u8] = b"sec-websocket-key";

/// Computes the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Builds the `101 Switching Protocols` response.
#[must_use]
pub fn response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    LineStart,
    Name { matched: usize, mismatch: bool },
    KeyValue,
    SkipValue,
    FinalNewline,
    Done,
}

/// Outcome of feeding bytes to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The request head is not complete yet.
    Pending,
    /// The head is complete; send the response and switch to frames.
    Complete {
        /// The `Sec-WebSocket-Accept` value.
        accept: String,
    },
}

/// Parser for one client's upgrade request.
#[derive(Debug)]
pub struct Handshake {
    state: State,
    seen: usize,
    limit: usize,
    pool: BufferPool,
    key: Writer,
    has_key: bool,
}

impl Handshake {
    /// Creates a parser that rejects request heads longer than `limit`.
    pub fn new(limit: usize, pool: BufferPool) -> Self {
        Self {
            state: State::RequestLine,
            seen: 0,
            limit,
            key: Writer::with_pool(pool.clone()),
            pool,
            has_key: false,
        }
    }

    /// Returns the number of request bytes consumed so far.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.seen
    }

    /// Consumes bytes from `input` until the head is complete or the input
    /// runs out.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HandshakeTooLarge`],
    /// [`ProtocolError::MalformedHeader`] or [`ProtocolError::MissingKey`].
    /// The connection must be dropped without a response.
    pub fn feed(&mut self, input: &mut Segment<'_>) -> ProtocolResult<HandshakeStatus> {
        while self.state != State::Done {
            let Ok(byte) = input.next_byte() else {
                return Ok(HandshakeStatus::Pending);
            };
            self.seen += 1;
            if self.seen > self.limit {
                return Err(ProtocolError::HandshakeTooLarge { limit: self.limit });
            }
            self.state = self.advance(byte)?;
        }
        if !self.has_key {
            return Err(ProtocolError::MissingKey);
        }
        let key = self.key.to_vec();
        Ok(HandshakeStatus::Complete {
            accept: accept_key(key.trim_ascii_end()),
        })
    }

    fn advance(&mut self, byte: u8) -> ProtocolResult<State> {
        let next = match self.state {
            State::RequestLine | State::SkipValue => match byte {
                b'\n' => State::LineStart,
                _ => self.state,
            },
            State::LineStart => match byte {
                b'\r' => State::FinalNewline,
                b'\n' => State::Done,
                b':' => return Err(ProtocolError::MalformedHeader),
                _ => State::Name {
                    matched: 1,
                    mismatch: !KEY_HEADER[0].eq_ignore_ascii_case(&byte),
                },
            },
            State::Name { matched, mismatch } => match byte {
                b':' if !mismatch && matched == KEY_HEADER.len() => {
                    self.key = Writer::with_pool(self.pool.clone());
                    self.has_key = true;
                    State::KeyValue
                }
                b':' => State::SkipValue,
                b'\r' | b'\n' => return Err(ProtocolError::MalformedHeader),
                _ => State::Name {
                    matched: matched + 1,
                    mismatch: mismatch
                        || KEY_HEADER
                            .get(matched)
                            .map_or(true, |expected| !expected.eq_ignore_ascii_case(&byte)),
                },
            },
            State::KeyValue => match byte {
                b'\n' => State::LineStart,
                b'\r' => State::KeyValue,
                b' ' | b'\t' if self.key.is_empty() => State::KeyValue,
                _ => {
                    self.key.write_u8(byte);
                    State::KeyValue
                }
            },
            State::FinalNewline => match byte {
                b'\n' => State::Done,
                _ => return Err(ProtocolError::MalformedHeader),
            },
            State::Done => State::Done,
        };
        Ok(next)
    }
}
