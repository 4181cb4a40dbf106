//! The per-connection receive state machine.
//!
//! Bytes are pushed into a window chain as they arrive and
//! [`Receiver::process`] parses as far as they allow. Whatever is missing
//! is recorded on the frame stack, so the next call resumes exactly where
//! this one stopped. Nothing here blocks or recurses.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, FrameKind, FrameStack};
use crate::message::{Header, Step, StepInput};
use crate::registry::{ActiveMessage, OpcodeRegistry, Task};
use blockwire_codec::{varint, Block, BufferPool, Chain};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Bytes after the opcode of a correlated message: u32 length, u16 id.
const CORRELATED_FIELDS_LEN: usize = 6;

/// Limits on what a peer may ask the receiver to buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveLimits {
    /// Largest blob or text primitive accepted.
    pub max_blob_len: usize,
    /// Largest single `Await` a message may request.
    pub max_await: usize,
}

impl ReceiveLimits {
    /// Default for both limits: 16 MiB.
    pub const DEFAULT_MAX: usize = 16 * 1024 * 1024;

    /// Creates the default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_blob_len: Self::DEFAULT_MAX,
            max_await: Self::DEFAULT_MAX,
        }
    }

    /// Sets the largest accepted blob.
    #[must_use]
    pub const fn max_blob_len(mut self, len: usize) -> Self {
        self.max_blob_len = len;
        self
    }

    /// Sets the largest accepted await.
    #[must_use]
    pub const fn max_await(mut self, bytes: usize) -> Self {
        self.max_await = bytes;
        self
    }
}

impl Default for ReceiveLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// A primitive's result waiting to be handed to its parent frame.
enum Delivery {
    Compressed(u64),
    Blob(Vec<u8>),
    Text(String),
}

impl Delivery {
    fn into_input(self) -> StepInput<'static, 'static> {
        match self {
            Delivery::Compressed(value) => StepInput::Compressed(value),
            Delivery::Blob(bytes) => StepInput::Blob(bytes),
            Delivery::Text(text) => StepInput::Text(text),
        }
    }
}

/// Parses one connection's inbound byte stream into messages.
pub struct Receiver<C> {
    registry: Arc<OpcodeRegistry<C>>,
    limits: ReceiveLimits,
    window: Chain,
    frames: FrameStack,
    header: Header,
    current: Option<Box<dyn ActiveMessage<C>>>,
    delivery: Option<Delivery>,
}

impl<C: Send + Sync + 'static> Receiver<C> {
    /// Creates a receiver whose window takes blocks from `pool`.
    pub fn new(registry: Arc<OpcodeRegistry<C>>, limits: ReceiveLimits, pool: BufferPool) -> Self {
        Self {
            registry,
            limits,
            window: Chain::new(pool),
            frames: FrameStack::new(),
            header: Header::default(),
            current: None,
            delivery: None,
        }
    }

    /// Appends a received block to the window.
    pub fn push_block(&mut self, block: Block) {
        if !block.is_empty() {
            self.window.push(block);
        }
    }

    /// Appends received bytes to the window.
    pub fn push(&mut self, chain: Chain) {
        self.window.append(chain);
    }

    /// Copies received bytes into the window.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.window.extend_from_slice(bytes);
    }

    /// Returns the number of received bytes not yet parsed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    /// Returns the current depth of the frame stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.depth()
    }

    /// Returns true between messages with nothing buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.frames.is_empty() && self.window.is_empty()
    }

    /// Parses every complete message in the window.
    ///
    /// Sync handlers run before this returns; futures of async handlers
    /// are returned for the caller to spawn, in arrival order.
    ///
    /// # Errors
    ///
    /// Any error is a desync. The receiver is left in an undefined state
    /// and the connection must be killed.
    pub fn process(&mut self, context: &C) -> ProtocolResult<Vec<Task>> {
        let mut tasks = Vec::new();
        loop {
            if self.frames.is_empty() {
                if self.window.is_empty() {
                    return Ok(tasks);
                }
                self.frames.push(Frame::new(FrameKind::Opcode, 0, 1))?;
            }
            let Some(frame) = self.frames.top() else {
                return Ok(tasks);
            };
            let delivery = self.delivery.take();
            if delivery.is_none() && self.window.len() < frame.bytes_required {
                return Ok(tasks);
            }
            match frame.kind {
                FrameKind::Opcode => self.read_opcode()?,
                FrameKind::CorrelatedHeader => self.read_correlated_header()?,
                FrameKind::Message => {
                    if let Some(task) = self.step_message(frame.phase, delivery, context)? {
                        tasks.push(task);
                    }
                }
                FrameKind::Compressed => self.read_compressed()?,
                FrameKind::Blob { len } => self.read_blob(len, delivery)?,
                FrameKind::Text => self.read_text(delivery)?,
            }
        }
    }

    fn read_opcode(&mut self) -> ProtocolResult<()> {
        let code = self.window.segment().next_byte()?;
        self.window.consume(1);
        let registry = Arc::clone(&self.registry);
        let entry = registry
            .entry(code)
            .ok_or(ProtocolError::UnknownOpcode(code))?;
        self.header = Header {
            opcode: code,
            request_id: None,
            payload_len: None,
        };
        if entry.options().correlated {
            return self
                .frames
                .replace_top(Frame::new(FrameKind::CorrelatedHeader, 0, CORRELATED_FIELDS_LEN));
        }
        self.start_message(entry.instantiate())
    }

    fn read_correlated_header(&mut self) -> ProtocolResult<()> {
        let mut segment = self.window.segment();
        let payload_len = segment.read_u32()?;
        let request_id = segment.read_u16()?;
        drop(segment);
        self.window.consume(CORRELATED_FIELDS_LEN);
        self.header.payload_len = Some(payload_len);
        self.header.request_id = Some(request_id);

        let registry = Arc::clone(&self.registry);
        let entry = registry
            .entry(self.header.opcode)
            .ok_or(ProtocolError::UnknownOpcode(self.header.opcode))?;
        self.start_message(entry.instantiate())
    }

    fn start_message(&mut self, mut message: Box<dyn ActiveMessage<C>>) -> ProtocolResult<()> {
        trace!(opcode = self.header.opcode, request_id = ?self.header.request_id, "message start");
        message.begin(&self.header);
        self.current = Some(message);
        self.frames.replace_top(Frame::new(FrameKind::Message, 0, 0))
    }

    fn step_message(
        &mut self,
        phase: u16,
        delivery: Option<Delivery>,
        context: &C,
    ) -> ProtocolResult<Option<Task>> {
        let Some(message) = self.current.as_mut() else {
            return Err(ProtocolError::invalid_phase("message", phase));
        };
        let step = match delivery {
            Some(delivery) => message.step(phase, delivery.into_input())?,
            None => {
                let mut segment = self.window.segment();
                let step = message.step(phase, StepInput::Bytes(&mut segment));
                let used = segment.consumed();
                drop(segment);
                self.window.consume(used);
                step?
            }
        };

        match step {
            Step::Await { bytes, phase } => {
                if bytes > self.limits.max_await {
                    return Err(ProtocolError::AwaitTooLarge {
                        bytes,
                        max: self.limits.max_await,
                    });
                }
                self.frames.replace_top(Frame::new(FrameKind::Message, phase, bytes))?;
            }
            Step::Compressed { phase } => {
                self.frames.replace_top(Frame::new(FrameKind::Message, phase, 0))?;
                self.frames.push(Frame::new(FrameKind::Compressed, 0, 1))?;
            }
            Step::Blob { phase } => {
                self.frames.replace_top(Frame::new(FrameKind::Message, phase, 0))?;
                self.frames
                    .push(Frame::new(FrameKind::Blob { len: None }, 0, 0))?;
            }
            Step::Text { phase } => {
                self.frames.replace_top(Frame::new(FrameKind::Message, phase, 0))?;
                self.frames.push(Frame::new(FrameKind::Text, 0, 0))?;
            }
            Step::Done => {
                self.frames.pop();
                if let Some(message) = self.current.take() {
                    return message.dispatch(context);
                }
            }
        }
        Ok(None)
    }

    fn read_compressed(&mut self) -> ProtocolResult<()> {
        let mut segment = self.window.segment();
        match segment.read_compressed() {
            Ok(value) => {
                let used = segment.consumed();
                drop(segment);
                self.window.consume(used);
                self.frames.pop();
                self.delivery = Some(Delivery::Compressed(value));
                Ok(())
            }
            Err(err) if err.is_eof() => {
                let marker = segment.peek().ok_or(err)?;
                let needed = varint::len_from_marker(marker)?;
                drop(segment);
                if let Some(top) = self.frames.top_mut() {
                    top.bytes_required = needed;
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_blob(&mut self, len: Option<usize>, delivery: Option<Delivery>) -> ProtocolResult<()> {
        match (len, delivery) {
            (None, None) => self.frames.push(Frame::new(FrameKind::Compressed, 0, 1)),
            (None, Some(Delivery::Compressed(announced))) => {
                let len = usize::try_from(announced)
                    .ok()
                    .filter(|len| *len <= self.limits.max_blob_len)
                    .ok_or(ProtocolError::BlobTooLarge {
                        len: announced,
                        max: self.limits.max_blob_len,
                    })?;
                self.frames
                    .replace_top(Frame::new(FrameKind::Blob { len: Some(len) }, 0, len))
            }
            (Some(len), None) => {
                let bytes = self.window.segment().read_exact(len)?;
                self.window.consume(len);
                self.frames.pop();
                self.delivery = Some(Delivery::Blob(bytes));
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedInput {
                phase: 0,
                expected: "blob length",
            }),
        }
    }

    fn read_text(&mut self, delivery: Option<Delivery>) -> ProtocolResult<()> {
        match delivery {
            None => self.frames.push(Frame::new(FrameKind::Blob { len: None }, 0, 0)),
            Some(Delivery::Blob(bytes)) => {
                let text = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
                self.frames.pop();
                self.delivery = Some(Delivery::Text(text));
                Ok(())
            }
            Some(_) => Err(ProtocolError::UnexpectedInput {
                phase: 0,
                expected: "text bytes",
            }),
        }
    }
}

impl<C> fmt::Debug for Receiver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("buffered", &self.window.len())
            .field("frames", &self.frames)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Payload, Pooled};
    use crate::registry::OpcodeOptions;
    use blockwire_codec::Writer;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::future::Future;

    /// A message exercising every primitive: a compressed count, then that
    /// many text items, then a blob.
    #[derive(Debug, Default)]
    struct Listing {
        count: u64,
        items: Vec<String>,
        attachment: Vec<u8>,
    }

    impl Listing {
        const COUNT: u16 = 1;
        const ITEM: u16 = 2;
        const ATTACHMENT: u16 = 3;
    }

    impl Message for Listing {
        const NAME: &'static str = "Listing";

        fn step(&mut self, phase: u16, input: StepInput<'_, '_>) -> ProtocolResult<Step> {
            match phase {
                0 => Ok(Step::Compressed { phase: Self::COUNT }),
                Self::COUNT => {
                    self.count = input.compressed(phase)?;
                    Ok(self.next_item())
                }
                Self::ITEM => {
                    self.items.push(input.text(phase)?);
                    Ok(self.next_item())
                }
                Self::ATTACHMENT => {
                    self.attachment = input.blob(phase)?;
                    Ok(Step::Done)
                }
                _ => Err(ProtocolError::invalid_phase(Self::NAME, phase)),
            }
        }
    }

    impl Listing {
        fn next_item(&self) -> Step {
            if (self.items.len() as u64) < self.count {
                Step::Text { phase: Self::ITEM }
            } else {
                Step::Blob {
                    phase: Self::ATTACHMENT,
                }
            }
        }
    }

    type Seen = Arc<Mutex<Vec<(Vec<String>, Vec<u8>)>>>;

    const LISTING: u8 = 7;
    const ECHO: u8 = 8;

    fn registry() -> Arc<OpcodeRegistry<Seen>> {
        let mut registry = OpcodeRegistry::new();
        registry
            .register(LISTING, OpcodeOptions::new("listing"), |m: &mut Listing, seen: &Seen| {
                seen.lock()
                    .push((std::mem::take(&mut m.items), std::mem::take(&mut m.attachment)));
                Ok(())
            })
            .unwrap();
        registry
            .register_async(
                ECHO,
                OpcodeOptions::new("echo").correlated(),
                |m: Pooled<Payload>, seen: Seen| async move {
                    seen.lock().push((Vec::new(), m.data().to_vec()));
                },
            )
            .unwrap();
        Arc::new(registry)
    }

    fn receiver(registry: Arc<OpcodeRegistry<Seen>>) -> Receiver<Seen> {
        Receiver::new(registry, ReceiveLimits::default(), BufferPool::new(16))
    }

    fn listing(items: &[&str], attachment: &[u8]) -> Vec<u8> {
        let mut writer = Writer::start_in(BufferPool::new(32), LISTING);
        writer.write_compressed(items.len() as u64);
        for item in items {
            writer.write_str(item);
        }
        writer.write_blob(attachment);
        writer.to_vec()
    }

    fn echo(request_id: u16, body: &[u8]) -> Vec<u8> {
        let mut writer = Writer::start_correlated_in(BufferPool::new(32), ECHO);
        writer.write_bytes(body);
        writer.finish().unwrap();
        writer.set_request_id(request_id).unwrap();
        writer.to_vec()
    }

    struct NoopWake;

    impl std::task::Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn run_tasks(tasks: Vec<Task>) {
        // the echo handler never awaits, so one poll completes it
        let waker = std::task::Waker::from(Arc::new(NoopWake));
        let mut cx = std::task::Context::from_waker(&waker);
        for mut task in tasks {
            assert!(task.as_mut().poll(&mut cx).is_ready());
        }
    }

    #[test]
    fn whole_message_dispatches_sync_handler() {
        let seen = Seen::default();
        let mut rx = receiver(registry());
        rx.push_slice(&listing(&["a", "bc"], b"xyz"));
        assert!(rx.process(&seen).unwrap().is_empty());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, vec!["a".to_string(), "bc".to_string()]);
        assert_eq!(seen[0].1, b"xyz");
        assert!(rx.is_idle());
    }

    #[test]
    fn byte_at_a_time_resumes_where_it_stopped() {
        let seen = Seen::default();
        let mut rx = receiver(registry());
        let bytes = listing(&["hello", "", "world"], &[9; 300]);
        for (i, byte) in bytes.iter().enumerate() {
            rx.push_slice(&[*byte]);
            rx.process(&seen).unwrap();
            if i + 1 < bytes.len() {
                assert!(seen.lock().is_empty());
                assert!(rx.depth() >= 1);
            }
        }
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].1.len(), 300);
        assert!(rx.is_idle());
    }

    #[test]
    fn correlated_async_message_returns_a_task() {
        let seen = Seen::default();
        let mut rx = receiver(registry());
        let mut stream = echo(42, b"ping");
        stream.extend(listing(&[], b""));
        rx.push_slice(&stream);

        let tasks = rx.process(&seen).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(seen.lock().len(), 1);
        run_tasks(tasks);
        assert_eq!(seen.lock()[1].1, b"ping");
    }

    #[test]
    fn unknown_opcode_is_a_desync() {
        let mut rx = receiver(registry());
        rx.push_slice(&[99]);
        assert!(matches!(
            rx.process(&Seen::default()),
            Err(ProtocolError::UnknownOpcode(99))
        ));
    }

    #[test]
    fn oversized_blob_is_rejected_before_buffering() {
        let mut rx = Receiver::new(
            registry(),
            ReceiveLimits::new().max_blob_len(4),
            BufferPool::new(16),
        );
        rx.push_slice(&listing(&[], b"too long"));
        assert!(matches!(
            rx.process(&Seen::default()),
            Err(ProtocolError::BlobTooLarge { len: 8, max: 4 })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut writer = Writer::start_in(BufferPool::new(32), LISTING);
        writer.write_compressed(1);
        writer.write_blob(&[0xff, 0xfe]);
        let mut rx = receiver(registry());
        rx.push_slice(&writer.to_vec());
        assert!(matches!(
            rx.process(&Seen::default()),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn oversized_await_is_rejected() {
        let mut rx = Receiver::new(
            registry(),
            ReceiveLimits::new().max_await(2),
            BufferPool::new(16),
        );
        rx.push_slice(&echo(1, b"four"));
        assert!(matches!(
            rx.process(&Seen::default()),
            Err(ProtocolError::AwaitTooLarge { bytes: 4, max: 2 })
        ));
    }

    proptest! {
        #[test]
        fn any_split_parses_like_one_read(
            items in proptest::collection::vec("[a-z]{0,20}", 0..6),
            attachment in proptest::collection::vec(any::<u8>(), 0..200),
            cuts in proptest::collection::vec(1usize..40, 0..30),
        ) {
            let refs: Vec<&str> = items.iter().map(String::as_str).collect();
            let mut bytes = listing(&refs, &attachment);
            bytes.extend(listing(&refs, &attachment));

            let seen = Seen::default();
            let mut rx = receiver(registry());
            let mut rest = bytes.as_slice();
            for cut in cuts {
                let n = cut.min(rest.len());
                rx.push_slice(&rest[..n]);
                rest = &rest[n..];
                rx.process(&seen).unwrap();
            }
            rx.push_slice(rest);
            rx.process(&seen).unwrap();

            let seen = seen.lock();
            prop_assert_eq!(seen.len(), 2);
            prop_assert_eq!(&seen[0].0, &items);
            prop_assert_eq!(&seen[1].1, &attachment);
            prop_assert!(rx.is_idle());
        }
    }
}
