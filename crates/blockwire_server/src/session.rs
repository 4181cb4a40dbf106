//! Handle to one live connection.

use crate::error::{ServerError, ServerResult};
use blockwire_codec::{BufferPool, Writer};
use blockwire_protocol::{
    Outgoing, RequestError, ResponseResult, SendQueue, Wake, OPCODE_RESPONSE,
};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

struct Inner {
    id: Uuid,
    peer: SocketAddr,
    queue: SendQueue,
    wake: Arc<Notify>,
}

/// A cloneable handle to a connection's send side.
///
/// Handlers receive one with every message; async handlers may keep it for
/// as long as they like. Once the connection collapses every send returns
/// false and every request fails.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub(crate) fn new(peer: SocketAddr, pool: BufferPool, request_ids: u16) -> Self {
        let wake = Arc::new(Notify::new());
        let notify = Arc::clone(&wake);
        let waker: Arc<dyn Wake> = Arc::new(move || notify.notify_one());
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                peer,
                queue: SendQueue::new(pool, request_ids, waker),
                wake,
            }),
        }
    }

    /// Returns the connection id used in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Returns the connection's send queue.
    #[must_use]
    pub fn queue(&self) -> &SendQueue {
        &self.inner.queue
    }

    /// Returns the pool the connection's blocks come from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        self.inner.queue.pool()
    }

    /// Starts an uncorrelated message in the connection's pool.
    #[must_use]
    pub fn writer(&self, opcode: u8) -> Writer {
        Writer::start_in(self.pool().clone(), opcode)
    }

    /// Starts a correlated message in the connection's pool.
    #[must_use]
    pub fn correlated_writer(&self, opcode: u8) -> Writer {
        Writer::start_correlated_in(self.pool().clone(), opcode)
    }

    /// Queues a message. Returns false if the connection is gone.
    pub fn send(&self, writer: Writer) -> bool {
        self.inner.queue.send(Outgoing::Message(writer))
    }

    /// Sends a correlated request and waits for its response payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an uncorrelated writer, and
    /// [`RequestError`] if the connection closes or collapses first.
    pub async fn request(&self, writer: Writer) -> ServerResult<Bytes> {
        let (tx, rx) = oneshot::channel::<ResponseResult>();
        let outgoing = Outgoing::request(
            writer,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        if !self.inner.queue.send(outgoing) {
            return Err(ServerError::Request(RequestError::Closed));
        }
        let result = rx
            .await
            .map_err(|_| ServerError::Request(RequestError::Closed))?;
        Ok(result?)
    }

    /// Answers the request with `request_id`.
    pub fn reply(&self, request_id: u16, payload: &[u8]) -> bool {
        let mut writer = self.correlated_writer(OPCODE_RESPONSE);
        writer.write_bytes(payload);
        if writer.set_request_id(request_id).is_err() {
            return false;
        }
        self.send(writer)
    }

    /// Collapses the connection, failing every outstanding request.
    pub fn close(&self, reason: &str) {
        self.inner.queue.collapse(reason);
    }

    /// Returns false once the connection has collapsed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.queue.is_open()
    }

    pub(crate) async fn notified(&self) {
        self.inner.wake.notified().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SocketAddr::from(([127, 0, 0, 1], 1)), BufferPool::new(64), 2)
    }

    #[test]
    fn reply_carries_the_request_id() {
        let session = session();
        assert!(session.reply(0x0102, b"ok"));
        let block = session.queue().next_block().unwrap();
        assert_eq!(
            block.as_slice(),
            &[OPCODE_RESPONSE, 2, 0, 0, 0, 0x02, 0x01, b'o', b'k']
        );
    }

    #[tokio::test]
    async fn request_fails_when_the_session_collapses() {
        let session = session();
        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut writer = session.correlated_writer(9);
                writer.write_bytes(b"q");
                session.request(writer).await
            })
        };
        while session.queue().pending_requests() == 0 {
            if session.queue().next_block().is_none() {
                tokio::task::yield_now().await;
            }
        }
        session.close("test over");

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_collapsed());
        assert!(!session.send(session.writer(3)));
    }

    #[tokio::test]
    async fn uncorrelated_request_is_refused() {
        let session = session();
        let err = session.request(session.writer(3)).await.unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
    }
}
