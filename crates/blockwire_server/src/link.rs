//! Inter-process link: the client side of a raw-mode connection.

use crate::builtin;
use crate::config::{ConnectionMode, ServerConfig};
use crate::connection::{drive, ConnectionSettings};
use crate::error::ServerResult;
use crate::session::Session;
use blockwire_codec::{BufferPool, Writer};
use blockwire_protocol::{OpcodeRegistry, OPCODE_PING};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// An outbound connection speaking the protocol without websocket framing.
///
/// Both ends may send requests; the peer's requests are dispatched through
/// the link's own registry. Dropping the link closes the connection.
pub struct Link {
    session: Session,
    stop: watch::Sender<bool>,
    task: JoinHandle<ServerResult<()>>,
}

impl Link {
    /// Connects to `addr`. Block size, request ids and receive limits come
    /// from `config`; its bind address and mode are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be made or `registry` already uses a
    /// builtin opcode.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        mut registry: OpcodeRegistry<Session>,
        config: &ServerConfig,
    ) -> ServerResult<Self> {
        builtin::install(&mut registry)?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let session = Session::new(peer, BufferPool::new(config.block_size), config.request_ids);
        debug!(%peer, session = %session.id(), "link connected");

        let settings = ConnectionSettings {
            mode: ConnectionMode::Raw,
            handshake_limit: config.handshake_limit,
            limits: config.receive_limits,
        };
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(drive(
            stream,
            session.clone(),
            Arc::new(registry),
            settings,
            stop_rx,
        ));
        Ok(Self {
            session,
            stop,
            task,
        })
    }

    /// Returns the link's session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends a correlated request and waits for the response payload.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn request(&self, writer: Writer) -> ServerResult<Bytes> {
        self.session.request(writer).await
    }

    /// Sends a builtin ping and returns the echoed payload.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn ping(&self, payload: &[u8]) -> ServerResult<Bytes> {
        let mut writer = self.session.correlated_writer(OPCODE_PING);
        writer.write_bytes(payload);
        self.request(writer).await
    }

    /// Returns false once the connection has collapsed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Closes the connection and waits for its tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection, if any.
    pub async fn close(self) -> ServerResult<()> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(std::io::Error::other(err).into()),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("session", &self.session).finish()
    }
}
