//! Websocket frame codec.
//!
//! The subset of RFC 6455 a browser client needs: masked client frames are
//! decoded incrementally and unmasked in place, and outgoing chains are
//! wrapped in a single unmasked binary frame. Extensions are never
//! negotiated, so any reserved bit is a desync.

use crate::error::{ProtocolError, ProtocolResult};
use blockwire_codec::{Block, Chain};

/// Continuation frame.
pub const OPCODE_CONTINUATION: u8 = 0x0;
/// Text data frame.
pub const OPCODE_TEXT: u8 = 0x1;
/// Binary data frame.
pub const OPCODE_BINARY: u8 = 0x2;
/// Connection close.
pub const OPCODE_CLOSE: u8 = 0x8;
/// Ping.
pub const OPCODE_PING: u8 = 0x9;
/// Pong.
pub const OPCODE_PONG: u8 = 0xA;

const FIN: u8 = 0x80;
const RESERVED_BITS: u8 = 0x70;
const MASK_BIT: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: u64 = 125;

fn is_control(opcode: u8) -> bool {
    opcode & 0x08 != 0
}

/// A control frame the connection must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Answer with a pong carrying the same payload.
    Ping(Vec<u8>),
    /// A pong; nothing to do.
    Pong,
    /// The peer is closing the connection.
    Close,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Start,
    Length {
        opcode: u8,
    },
    ExtendedLength {
        opcode: u8,
        width: u8,
        read: u8,
        value: u64,
    },
    MaskKey {
        opcode: u8,
        len: u64,
        key: [u8; 4],
        read: u8,
    },
    Payload {
        opcode: u8,
        remaining: u64,
        key: [u8; 4],
        phase: usize,
    },
}

/// Incremental decoder for client-to-server frames.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    control: Vec<u8>,
    /// A data frame without FIN was seen and its final fragment was not.
    fragment_open: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder positioned before a frame header.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Start,
            control: Vec::new(),
            fragment_open: false,
        }
    }

    /// Returns true between frames.
    #[must_use]
    pub fn is_between_frames(&self) -> bool {
        matches!(self.state, State::Start)
    }

    /// Decodes a received block.
    ///
    /// Data payload bytes are unmasked in place and moved to `out`; when the
    /// block carries a single run of payload the block itself is moved.
    /// Completed control frames are returned in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::WebSocket`] for unmasked frames, reserved
    /// bits, unknown opcodes, malformed control frames, and fragments out of
    /// order.
    pub fn decode(&mut self, mut block: Block, out: &mut Chain) -> ProtocolResult<Vec<Control>> {
        let mut events = Vec::new();
        let mut runs: Vec<(usize, usize)> = Vec::new();
        let end = block.len();
        let mut i = 0;

        while i < end {
            if let State::Payload {
                opcode,
                remaining,
                key,
                phase,
            } = self.state
            {
                let n = usize::try_from(remaining).map_or(end - i, |r| r.min(end - i));
                let bytes = &mut block.as_mut_slice()[i..i + n];
                for (k, byte) in bytes.iter_mut().enumerate() {
                    *byte ^= key[(phase + k) % 4];
                }
                if is_control(opcode) {
                    self.control.extend_from_slice(bytes);
                } else {
                    runs.push((i, i + n));
                }
                i += n;
                let remaining = remaining - n as u64;
                if remaining == 0 {
                    self.state = State::Start;
                    events.extend(self.finish(opcode));
                } else {
                    self.state = State::Payload {
                        opcode,
                        remaining,
                        key,
                        phase: (phase + n) % 4,
                    };
                }
                continue;
            }

            let byte = block.as_slice()[i];
            i += 1;
            if let Some(event) = self.header_byte(byte)? {
                events.push(event);
            }
        }

        if let [(start, stop)] = runs[..] {
            block.truncate(stop);
            block.discard_front(start);
            out.push(block);
        } else {
            for &(start, stop) in &runs {
                out.extend_from_slice(&block.as_slice()[start..stop]);
            }
        }
        Ok(events)
    }

    fn header_byte(&mut self, byte: u8) -> ProtocolResult<Option<Control>> {
        match self.state {
            State::Start => {
                if byte & RESERVED_BITS != 0 {
                    return Err(ProtocolError::websocket(format!(
                        "reserved bits set: {byte:#04x}"
                    )));
                }
                let opcode = byte & 0x0F;
                match opcode {
                    OPCODE_CONTINUATION if !self.fragment_open => {
                        return Err(ProtocolError::websocket(
                            "continuation frame without a fragmented message",
                        ));
                    }
                    OPCODE_TEXT | OPCODE_BINARY if self.fragment_open => {
                        return Err(ProtocolError::websocket(
                            "new message before the last fragment",
                        ));
                    }
                    OPCODE_CONTINUATION | OPCODE_TEXT | OPCODE_BINARY => {
                        self.fragment_open = byte & FIN == 0;
                    }
                    OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG if byte & FIN != 0 => {}
                    OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => {
                        return Err(ProtocolError::websocket("fragmented control frame"));
                    }
                    other => {
                        return Err(ProtocolError::websocket(format!("unknown opcode {other:#x}")));
                    }
                }
                self.state = State::Length { opcode };
            }
            State::Length { opcode } => {
                if byte & MASK_BIT == 0 {
                    return Err(ProtocolError::websocket("client frame is not masked"));
                }
                let width = match byte & 0x7F {
                    126 => 2,
                    127 => 8,
                    len => {
                        self.state = State::MaskKey {
                            opcode,
                            len: u64::from(len),
                            key: [0; 4],
                            read: 0,
                        };
                        return Ok(None);
                    }
                };
                if is_control(opcode) {
                    return Err(ProtocolError::websocket("control frame payload too long"));
                }
                self.state = State::ExtendedLength {
                    opcode,
                    width,
                    read: 0,
                    value: 0,
                };
            }
            State::ExtendedLength {
                opcode,
                width,
                read,
                value,
            } => {
                let value = (value << 8) | u64::from(byte);
                let read = read + 1;
                if read < width {
                    self.state = State::ExtendedLength {
                        opcode,
                        width,
                        read,
                        value,
                    };
                } else {
                    if value >> 63 != 0 {
                        return Err(ProtocolError::websocket("payload length has the high bit set"));
                    }
                    self.state = State::MaskKey {
                        opcode,
                        len: value,
                        key: [0; 4],
                        read: 0,
                    };
                }
            }
            State::MaskKey {
                opcode,
                len,
                mut key,
                read,
            } => {
                key[usize::from(read)] = byte;
                let read = read + 1;
                if read < 4 {
                    self.state = State::MaskKey {
                        opcode,
                        len,
                        key,
                        read,
                    };
                } else if len == 0 {
                    self.state = State::Start;
                    return Ok(self.finish(opcode));
                } else {
                    if is_control(opcode) && len > MAX_CONTROL_PAYLOAD {
                        return Err(ProtocolError::websocket("control frame payload too long"));
                    }
                    self.state = State::Payload {
                        opcode,
                        remaining: len,
                        key,
                        phase: 0,
                    };
                }
            }
            State::Payload { .. } => {}
        }
        Ok(None)
    }

    fn finish(&mut self, opcode: u8) -> Option<Control> {
        match opcode {
            OPCODE_PING => Some(Control::Ping(std::mem::take(&mut self.control))),
            OPCODE_PONG => {
                self.control.clear();
                Some(Control::Pong)
            }
            OPCODE_CLOSE => {
                self.control.clear();
                Some(Control::Close)
            }
            _ => None,
        }
    }
}

/// Header of an unmasked server-to-client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    bytes: [u8; 10],
    len: usize,
}

impl FrameHeader {
    /// Builds a final-fragment header for `payload_len` bytes.
    #[must_use]
    pub fn new(opcode: u8, payload_len: u64) -> Self {
        let mut bytes = [0u8; 10];
        bytes[0] = FIN | (opcode & 0x0F);
        let len = match payload_len {
            0..=125 => {
                bytes[1] = payload_len as u8;
                2
            }
            126..=0xFFFF => {
                bytes[1] = 126;
                bytes[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
                4
            }
            _ => {
                bytes[1] = 127;
                bytes[2..10].copy_from_slice(&payload_len.to_be_bytes());
                10
            }
        };
        Self { bytes, len }
    }

    /// Header for a binary frame.
    #[must_use]
    pub fn binary(payload_len: u64) -> Self {
        Self::new(OPCODE_BINARY, payload_len)
    }

    /// Returns the encoded header.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Encodes a complete unmasked control frame. Payloads are cut to 125 bytes.
#[must_use]
pub fn control_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD as usize)];
    let header = FrameHeader::new(opcode, payload.len() as u64);
    let mut frame = header.as_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// Encodes a complete masked frame, as a client sends it.
#[must_use]
pub fn masked_frame(opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let header = FrameHeader::new(opcode, payload.len() as u64);
    let mut frame = header.as_bytes().to_vec();
    frame[1] |= MASK_BIT;
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}
