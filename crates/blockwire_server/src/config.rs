//! Server configuration.

use blockwire_codec::DEFAULT_BLOCK_SIZE;
use blockwire_protocol::handshake::DEFAULT_HANDSHAKE_LIMIT;
use blockwire_protocol::ReceiveLimits;
use std::net::SocketAddr;

/// How a freshly accepted connection starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Browser clients: an HTTP upgrade, then websocket frames.
    #[default]
    WebSocket,
    /// Tool links: protocol bytes from the first byte on.
    Raw,
}

/// Configuration for a server or link.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Size of the pooled blocks used for socket reads and writes.
    pub block_size: usize,
    /// Request ids per connection.
    pub request_ids: u16,
    /// How accepted connections start.
    pub mode: ConnectionMode,
    /// Cap on the size of a websocket upgrade request.
    pub handshake_limit: usize,
    /// Limits on what a peer may make the receiver buffer.
    pub receive_limits: ReceiveLimits,
}

impl ServerConfig {
    /// Creates a configuration bound to `bind_addr` with default limits.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            block_size: DEFAULT_BLOCK_SIZE,
            request_ids: 256,
            mode: ConnectionMode::WebSocket,
            handshake_limit: DEFAULT_HANDSHAKE_LIMIT,
            receive_limits: ReceiveLimits::new(),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the block size.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the request ids per connection.
    pub fn with_request_ids(mut self, ids: u16) -> Self {
        self.request_ids = ids;
        self
    }

    /// Sets how accepted connections start.
    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the handshake size limit.
    pub fn with_handshake_limit(mut self, limit: usize) -> Self {
        self.handshake_limit = limit;
        self
    }

    /// Sets the largest blob a peer may send.
    pub fn with_max_blob_len(mut self, len: usize) -> Self {
        self.receive_limits = self.receive_limits.max_blob_len(len);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
