//! Per-connection send queue.
//!
//! Producers call [`SendQueue::send`] from any task. A single pump drains
//! the queue one block at a time with [`SendQueue::next_block`], writes the
//! block to the socket and drops it, which returns it to its pool. The pump
//! parks when `next_block` returns `None` and is woken through [`Wake`]
//! when there is work again.

use crate::error::{ProtocolError, ProtocolResult, RequestError};
use crate::request::{PendingRequests, RequestIdStack, ResponseCallback};
use crate::websocket::FrameHeader;
use blockwire_codec::{Block, BufferPool, Chain, Writer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wakes a parked send pump.
pub trait Wake: Send + Sync {
    /// Called with the queue lock released.
    fn wake(&self);
}

impl<F: Fn() + Send + Sync> Wake for F {
    fn wake(&self) {
        self()
    }
}

/// How queued messages are framed on the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Messages go out as they are.
    #[default]
    Raw,
    /// Each message is wrapped in one binary websocket frame.
    WebSocket,
}

/// One unit of outgoing work.
pub enum Outgoing {
    /// A message, correlated or not. A correlated message keeps the
    /// request id already written into it, as a reply does.
    Message(Writer),
    /// A correlated request; an id is assigned when it reaches the head of
    /// the queue and the callback receives the response.
    Request(Writer, ResponseCallback),
    /// Bytes written exactly as given, outside any framing.
    Raw(Chain),
}

impl Outgoing {
    /// Creates a request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotCorrelated`] unless the writer was
    /// started with a correlated header.
    pub fn request(writer: Writer, callback: ResponseCallback) -> ProtocolResult<Self> {
        if !writer.is_correlated() {
            return Err(ProtocolError::NotCorrelated);
        }
        Ok(Self::Request(writer, callback))
    }

    fn finish(&mut self) -> ProtocolResult<()> {
        match self {
            Self::Message(writer) | Self::Request(writer, _) => Ok(writer.finish()?),
            Self::Raw(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(writer) => f.debug_tuple("Message").field(&writer.len()).finish(),
            Self::Request(writer, _) => f.debug_tuple("Request").field(&writer.len()).finish(),
            Self::Raw(chain) => f.debug_tuple("Raw").field(&chain.len()).finish(),
        }
    }
}

struct SendState {
    open: bool,
    can_process_send: bool,
    stalled: bool,
    framing: Framing,
    queue: VecDeque<Outgoing>,
    in_flight: Option<Chain>,
    ids: RequestIdStack,
    pending: PendingRequests,
}

/// Outgoing side of one connection.
pub struct SendQueue {
    pool: BufferPool,
    waker: Arc<dyn Wake>,
    state: Mutex<SendState>,
}

impl SendQueue {
    /// Creates an open, idle queue with `request_ids` request ids.
    pub fn new(pool: BufferPool, request_ids: u16, waker: Arc<dyn Wake>) -> Self {
        Self {
            pool,
            waker,
            state: Mutex::new(SendState {
                open: true,
                can_process_send: true,
                stalled: false,
                framing: Framing::Raw,
                queue: VecDeque::new(),
                in_flight: None,
                ids: RequestIdStack::new(request_ids),
                pending: PendingRequests::new(),
            }),
        }
    }

    /// Returns the pool outgoing blocks come from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Sets the framing for messages that reach the head of the queue.
    pub fn set_framing(&self, framing: Framing) {
        self.state.lock().framing = framing;
    }

    /// Queues outgoing work.
    ///
    /// Returns false, changing nothing, when the queue is closed. A message
    /// whose payload cannot be length-patched is dropped and also reported
    /// as false.
    pub fn send(&self, mut outgoing: Outgoing) -> bool {
        if let Err(err) = outgoing.finish() {
            warn!(error = %err, "dropping unencodable message");
            return false;
        }
        let wake = {
            let mut state = self.state.lock();
            if !state.open {
                return false;
            }
            state.queue.push_back(outgoing);
            let idle = state.can_process_send && !state.stalled;
            if idle {
                state.can_process_send = false;
            }
            idle
        };
        if wake {
            self.waker.wake();
        }
        true
    }

    /// Hands the next block to the socket writer.
    ///
    /// Returns `None` when there is nothing to write, or when the request
    /// at the head of the queue waits for a free id. The pump then parks
    /// until it is woken.
    pub fn next_block(&self) -> Option<Block> {
        let mut state = self.state.lock();
        loop {
            if let Some(chain) = state.in_flight.as_mut() {
                if let Some(block) = chain.pop_front() {
                    if chain.is_empty() {
                        state.in_flight = None;
                    }
                    return Some(block);
                }
                state.in_flight = None;
            }
            if !state.open {
                state.can_process_send = true;
                return None;
            }
            let Some(outgoing) = state.queue.pop_front() else {
                state.can_process_send = true;
                return None;
            };
            let (chain, framed) = match outgoing {
                Outgoing::Message(writer) => (writer.into_chain(), true),
                Outgoing::Raw(chain) => (chain, false),
                Outgoing::Request(mut writer, callback) => {
                    let Some(id) = state.ids.take() else {
                        debug!(pending = state.pending.len(), "request ids exhausted, stalling");
                        state.queue.push_front(Outgoing::Request(writer, callback));
                        state.stalled = true;
                        state.can_process_send = true;
                        return None;
                    };
                    if let Err(err) = writer.set_request_id(id) {
                        warn!(error = %err, "dropping request without a correlated header");
                        state.ids.give_back(id);
                        continue;
                    }
                    state.pending.insert(id, callback);
                    (writer.into_chain(), true)
                }
            };
            let chain = if framed && state.framing == Framing::WebSocket {
                self.wrap(chain)
            } else {
                chain
            };
            state.in_flight = Some(chain);
        }
    }

    fn wrap(&self, chain: Chain) -> Chain {
        let header = FrameHeader::binary(chain.len() as u64);
        let mut framed = Chain::from_slice(self.pool.clone(), header.as_bytes());
        framed.append(chain);
        framed
    }

    /// Delivers a response to the request with `id`.
    ///
    /// Returns false if no request with that id is pending. The id goes
    /// back to the stack and a stalled pump is woken.
    pub fn complete_request(&self, id: u16, payload: Bytes) -> bool {
        let (callback, wake) = {
            let mut state = self.state.lock();
            let Some(callback) = state.pending.remove(id) else {
                return false;
            };
            state.ids.give_back(id);
            let wake = state.stalled && state.open;
            if wake {
                state.stalled = false;
                state.can_process_send = false;
            }
            (callback, wake)
        };
        if wake {
            self.waker.wake();
        }
        callback(Ok(payload));
        true
    }

    /// Closes the queue and fails every pending and parked request once.
    ///
    /// Queued messages are dropped. Later calls do nothing.
    pub fn collapse(&self, reason: &str) {
        let callbacks: Vec<ResponseCallback> = {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.stalled = false;
            state.in_flight = None;
            let mut callbacks: Vec<ResponseCallback> = state
                .pending
                .drain()
                .into_iter()
                .map(|(_, callback)| callback)
                .collect();
            for outgoing in state.queue.drain(..) {
                if let Outgoing::Request(_, callback) = outgoing {
                    callbacks.push(callback);
                }
            }
            callbacks
        };
        debug!(reason, failed = callbacks.len(), "send queue collapsed");
        for callback in callbacks {
            callback(Err(RequestError::collapsed(reason)));
        }
        self.waker.wake();
    }

    /// Returns false once the queue has collapsed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the number of queued, not yet started items.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true while a request waits for a free id.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }
}

impl fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SendQueue")
            .field("open", &state.open)
            .field("idle", &state.can_process_send)
            .field("stalled", &state.stalled)
            .field("framing", &state.framing)
            .field("queued", &state.queue.len())
            .field("pending", &state.pending)
            .finish()
    }
}
