//! # blockwire protocol
//!
//! The connection-level half of the wire protocol, free of any I/O.
//!
//! This crate provides:
//! - [`Receiver`], the resumable receive state machine driven by a fixed
//!   [`FrameStack`]
//! - [`Message`] state machines, their [`MessagePool`] and the builtin
//!   [`Payload`] message
//! - [`OpcodeRegistry`] for sync and async opcode handlers
//! - [`SendQueue`], which drains outgoing chains one block at a time and
//!   assigns request ids from a [`RequestIdStack`]
//! - the websocket [`handshake`] and frame codec ([`websocket`])
//!
//! Every message starts with a one-byte opcode. Correlated opcodes follow
//! it with a little-endian `u32` payload length and `u16` request id.
//! Opcode 0 is reserved.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod frame;
pub mod handshake;
mod message;
mod receiver;
mod registry;
mod request;
mod send;
pub mod websocket;

pub use error::{ProtocolError, ProtocolResult, RequestError};
pub use frame::{Frame, FrameKind, FrameStack, FRAME_CAPACITY};
pub use handshake::{Handshake, HandshakeStatus};
pub use message::{Header, Message, MessagePool, Payload, Pooled, Step, StepInput};
pub use receiver::{ReceiveLimits, Receiver};
pub use registry::{OpcodeOptions, OpcodeRegistry, Task};
pub use request::{PendingRequests, RequestIdStack, ResponseCallback, ResponseResult};
pub use send::{Framing, Outgoing, SendQueue, Wake};
pub use websocket::{Control, FrameDecoder};

/// Opcode of the builtin response message.
pub const OPCODE_RESPONSE: u8 = 1;

/// Opcode of the builtin ping request.
pub const OPCODE_PING: u8 = 2;
