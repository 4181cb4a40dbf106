//! Request ids and pending response callbacks.

use crate::error::RequestError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Result delivered to a response callback.
pub type ResponseResult = Result<Bytes, RequestError>;

/// Invoked once with the response payload or the reason there is none.
pub type ResponseCallback = Box<dyn FnOnce(ResponseResult) + Send>;

/// Free request ids of one connection.
///
/// Ids are handed out lowest first and reused as soon as they come back.
#[derive(Debug, Clone)]
pub struct RequestIdStack {
    free: Vec<u16>,
    /// Indexed by id; true while the id sits in `free`.
    is_free: Vec<bool>,
    capacity: u16,
}

impl RequestIdStack {
    /// Creates a stack holding ids `0..capacity`.
    #[must_use]
    pub fn new(capacity: u16) -> Self {
        Self {
            free: (0..capacity).rev().collect(),
            is_free: vec![true; usize::from(capacity)],
            capacity,
        }
    }

    /// Takes a free id, if any.
    pub fn take(&mut self) -> Option<u16> {
        let id = self.free.pop()?;
        self.is_free[usize::from(id)] = false;
        Some(id)
    }

    /// Returns an id to the stack. Ids outside the capacity and ids that
    /// are already free are ignored.
    pub fn give_back(&mut self, id: u16) {
        if let Some(slot) = self.is_free.get_mut(usize::from(id)) {
            if !*slot {
                *slot = true;
                self.free.push(id);
            }
        }
    }

    /// Returns the number of free ids.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Returns the total number of ids.
    #[must_use]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

/// Response callbacks keyed by the id of the request in flight.
#[derive(Default)]
pub struct PendingRequests {
    callbacks: HashMap<u16, ResponseCallback>,
}

impl PendingRequests {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the callback for `id`, returning one it displaced.
    pub fn insert(&mut self, id: u16, callback: ResponseCallback) -> Option<ResponseCallback> {
        self.callbacks.insert(id, callback)
    }

    /// Removes the callback for `id`.
    pub fn remove(&mut self, id: u16) -> Option<ResponseCallback> {
        self.callbacks.remove(&id)
    }

    /// Removes every callback.
    pub fn drain(&mut self) -> Vec<(u16, ResponseCallback)> {
        self.callbacks.drain().collect()
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns true if no request awaits a response.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.callbacks.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("PendingRequests").field("ids", &ids).finish()
    }
}
