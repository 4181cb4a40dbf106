//! Message state machines and their pool.
//!
//! A message type parses itself one phase at a time. The receiver calls
//! [`Message::step`] with phase 0 as soon as the opcode (and correlated
//! header, if any) is read; each call returns a [`Step`] that tells the
//! receiver what to buffer or decode before calling the next phase.

use crate::error::{ProtocolError, ProtocolResult};
use blockwire_codec::Segment;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a message needs before its next phase can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Suspend until at least `bytes` are buffered, then run `phase`.
    Await {
        /// Bytes that must be available.
        bytes: usize,
        /// Phase to resume.
        phase: u16,
    },
    /// Decode a compressed integer and deliver it to `phase`.
    Compressed {
        /// Phase receiving the value.
        phase: u16,
    },
    /// Decode a length-prefixed blob and deliver it to `phase`.
    Blob {
        /// Phase receiving the bytes.
        phase: u16,
    },
    /// Decode length-prefixed UTF-8 text and deliver it to `phase`.
    Text {
        /// Phase receiving the string.
        phase: u16,
    },
    /// The message is complete and can be dispatched.
    Done,
}

/// Input handed to a phase.
#[derive(Debug)]
pub enum StepInput<'s, 'c> {
    /// Buffered bytes. Holds at least what the previous `Await` asked for.
    Bytes(&'s mut Segment<'c>),
    /// Result of a `Compressed` step.
    Compressed(u64),
    /// Result of a `Blob` step.
    Blob(Vec<u8>),
    /// Result of a `Text` step.
    Text(String),
}

impl<'s, 'c> StepInput<'s, 'c> {
    /// Returns the buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedInput`] for decoded inputs.
    pub fn bytes(self, phase: u16) -> ProtocolResult<&'s mut Segment<'c>> {
        match self {
            Self::Bytes(segment) => Ok(segment),
            _ => Err(ProtocolError::UnexpectedInput {
                phase,
                expected: "bytes",
            }),
        }
    }

    /// Returns a decoded compressed integer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedInput`] for any other input.
    pub fn compressed(self, phase: u16) -> ProtocolResult<u64> {
        match self {
            Self::Compressed(value) => Ok(value),
            _ => Err(ProtocolError::UnexpectedInput {
                phase,
                expected: "compressed",
            }),
        }
    }

    /// Returns a decoded blob.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedInput`] for any other input.
    pub fn blob(self, phase: u16) -> ProtocolResult<Vec<u8>> {
        match self {
            Self::Blob(bytes) => Ok(bytes),
            _ => Err(ProtocolError::UnexpectedInput {
                phase,
                expected: "blob",
            }),
        }
    }

    /// Returns decoded text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedInput`] for any other input.
    pub fn text(self, phase: u16) -> ProtocolResult<String> {
        match self {
            Self::Text(text) => Ok(text),
            _ => Err(ProtocolError::UnexpectedInput {
                phase,
                expected: "text",
            }),
        }
    }
}

/// Header fields read before a message's first phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Opcode byte.
    pub opcode: u8,
    /// Request id, for correlated opcodes.
    pub request_id: Option<u16>,
    /// Payload length, for correlated opcodes.
    pub payload_len: Option<u32>,
}

/// A message type parsed by the receive state machine.
pub trait Message: Default + Send + 'static {
    /// Type name used in errors and logs.
    const NAME: &'static str;

    /// Called once with the header before phase 0.
    fn begin(&mut self, header: &Header) {
        let _ = header;
    }

    /// Runs one phase.
    ///
    /// # Errors
    ///
    /// Any error desyncs the connection.
    fn step(&mut self, phase: u16, input: StepInput<'_, '_>) -> ProtocolResult<Step>;

    /// Clears the message before it goes back to its pool.
    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct PoolShared<M> {
    free: Mutex<Vec<M>>,
    max_idle: usize,
    created: AtomicUsize,
}

/// Free list of message objects of one type.
pub struct MessagePool<M> {
    shared: Arc<PoolShared<M>>,
}

impl<M> Clone for MessagePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Message> MessagePool<M> {
    /// Default number of idle objects kept per type.
    pub const DEFAULT_MAX_IDLE: usize = 64;

    /// Creates a pool that keeps at most `max_idle` released objects.
    pub fn new(max_idle: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                max_idle,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes a reset object, creating one if the free list is empty.
    pub fn get(&self) -> Pooled<M> {
        let reused = self.shared.free.lock().pop();
        let message = reused.unwrap_or_else(|| {
            self.shared.created.fetch_add(1, Ordering::Relaxed);
            M::default()
        });
        Pooled {
            message,
            pool: self.clone(),
        }
    }

    /// Returns the number of objects waiting in the free list.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Returns how many objects this pool ever created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }

    fn release(&self, mut message: M) {
        message.reset();
        let mut free = self.shared.free.lock();
        if free.len() < self.shared.max_idle {
            free.push(message);
        }
    }
}

impl<M: Message> Default for MessagePool<M> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_IDLE)
    }
}

impl<M: Message> fmt::Debug for MessagePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePool")
            .field("message", &M::NAME)
            .field("idle", &self.idle())
            .field("created", &self.created())
            .finish()
    }
}

/// A message leased from a [`MessagePool`]; resets and returns on drop.
pub struct Pooled<M: Message> {
    message: M,
    pool: MessagePool<M>,
}

impl<M: Message> Deref for Pooled<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.message
    }
}

impl<M: Message> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.message
    }
}

impl<M: Message> Drop for Pooled<M> {
    fn drop(&mut self) {
        let message = std::mem::take(&mut self.message);
        self.pool.release(message);
    }
}

impl<M: Message + fmt::Debug> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// Reads the whole payload of a correlated message as bytes.
///
/// Used for responses, and as a catch-all body for opcodes whose payload is
/// parsed elsewhere. Uncorrelated opcodes have no length, so the payload is
/// empty.
#[derive(Debug, Default)]
pub struct Payload {
    request_id: Option<u16>,
    len: usize,
    data: Bytes,
}

impl Payload {
    const READ_BODY: u16 = 1;

    /// Returns the request id from the correlated header.
    #[must_use]
    pub fn request_id(&self) -> Option<u16> {
        self.request_id
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Takes the payload bytes, leaving the message empty.
    pub fn take_data(&mut self) -> Bytes {
        std::mem::take(&mut self.data)
    }
}

impl Message for Payload {
    const NAME: &'static str = "Payload";

    fn begin(&mut self, header: &Header) {
        self.request_id = header.request_id;
        self.len = header.payload_len.map_or(0, |len| len as usize);
    }

    fn step(&mut self, phase: u16, input: StepInput<'_, '_>) -> ProtocolResult<Step> {
        match phase {
            0 => Ok(Step::Await {
                bytes: self.len,
                phase: Self::READ_BODY,
            }),
            Self::READ_BODY => {
                let segment = input.bytes(phase)?;
                self.data = Bytes::from(segment.read_exact(self.len)?);
                Ok(Step::Done)
            }
            _ => Err(ProtocolError::invalid_phase(Self::NAME, phase)),
        }
    }
}
