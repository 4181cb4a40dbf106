//! The receiver's fixed-capacity parse stack.

use crate::error::{ProtocolError, ProtocolResult};

/// Maximum nesting of receive frames per connection.
pub const FRAME_CAPACITY: usize = 16;

/// What a receive frame is reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameKind {
    /// The opcode byte of the next message.
    #[default]
    Opcode,
    /// Payload length and request id of a correlated message.
    CorrelatedHeader,
    /// The message's own step function.
    Message,
    /// A compressed integer.
    Compressed,
    /// A length-prefixed blob; `len` is known once its length was read.
    Blob {
        /// Decoded length.
        len: Option<usize>,
    },
    /// Length-prefixed UTF-8 text.
    Text,
}

/// One entry of the parse stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// What the frame reads.
    pub kind: FrameKind,
    /// Phase to resume, for message frames.
    pub phase: u16,
    /// Bytes that must be buffered before the frame can run.
    pub bytes_required: usize,
}

impl Frame {
    /// Creates a frame.
    #[must_use]
    pub const fn new(kind: FrameKind, phase: u16, bytes_required: usize) -> Self {
        Self {
            kind,
            phase,
            bytes_required,
        }
    }
}

/// A fixed array of frames indexed by a stack pointer.
#[derive(Debug, Clone, Default)]
pub struct FrameStack {
    frames: [Frame; FRAME_CAPACITY],
    len: usize,
}

impl FrameStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameOverflow`] when the stack is full.
    pub fn push(&mut self, frame: Frame) -> ProtocolResult<()> {
        let slot = self.frames.get_mut(self.len).ok_or(ProtocolError::FrameOverflow {
            capacity: FRAME_CAPACITY,
        })?;
        *slot = frame;
        self.len += 1;
        Ok(())
    }

    /// Pops the top frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.len = self.len.checked_sub(1)?;
        Some(self.frames[self.len])
    }

    /// Returns a copy of the top frame.
    #[must_use]
    pub fn top(&self) -> Option<Frame> {
        self.len.checked_sub(1).map(|i| self.frames[i])
    }

    /// Returns the top frame mutably.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        let i = self.len.checked_sub(1)?;
        self.frames.get_mut(i)
    }

    /// Replaces the top frame, or pushes onto an empty stack.
    ///
    /// # Errors
    ///
    /// Never fails for a non-empty stack; see [`push`](Self::push).
    pub fn replace_top(&mut self, frame: Frame) -> ProtocolResult<()> {
        match self.top_mut() {
            Some(top) => {
                *top = frame;
                Ok(())
            }
            None => self.push(frame),
        }
    }

    /// Returns the number of frames on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.len
    }

    /// Returns true if no message is in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every frame.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}
