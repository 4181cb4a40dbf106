//! TCP listener.

use crate::builtin;
use crate::config::ServerConfig;
use crate::connection::{drive, ConnectionSettings};
use crate::error::ServerResult;
use crate::session::Session;
use blockwire_codec::BufferPool;
use blockwire_protocol::OpcodeRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// A bound server, ready to accept connections.
///
/// # Example
///
/// ```no_run
/// use blockwire_protocol::OpcodeRegistry;
/// use blockwire_server::{Server, ServerConfig};
///
/// # async fn run() -> blockwire_server::ServerResult<()> {
/// let server = Server::bind(ServerConfig::default(), OpcodeRegistry::new()).await?;
/// println!("listening on {}", server.local_addr()?);
/// server.run().await
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<OpcodeRegistry<Session>>,
    pool: BufferPool,
}

impl Server {
    /// Binds the listener and installs the builtin opcodes into `registry`.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the registry already uses a
    /// builtin opcode.
    pub async fn bind(
        config: ServerConfig,
        mut registry: OpcodeRegistry<Session>,
    ) -> ServerResult<Self> {
        builtin::install(&mut registry)?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, mode = ?config.mode, "listening");
        Ok(Self {
            pool: BufferPool::new(config.block_size),
            config,
            listener,
            registry: Arc::new(registry),
        })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns the socket error, if any.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the pool every connection of this server reads and writes
    /// through.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Accepts connections until the process ends.
    ///
    /// # Errors
    ///
    /// Accept errors are logged, not returned.
    pub async fn run(self) -> ServerResult<()> {
        let (_keep_open, never) = oneshot::channel();
        self.run_until(never).await
    }

    /// Accepts connections until `shutdown` fires, then closes every open
    /// connection.
    ///
    /// # Errors
    ///
    /// Accept errors are logged, not returned.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) -> ServerResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let settings = ConnectionSettings {
            mode: self.config.mode,
            handshake_limit: self.config.handshake_limit,
            limits: self.config.receive_limits,
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = accept(&self.listener, &permits) => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let session = Session::new(peer, self.pool.clone(), self.config.request_ids);
                    let registry = Arc::clone(&self.registry);
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = drive(stream, session, registry, settings, stop).await {
                            if e.is_desync() {
                                debug!(%peer, "connection killed: {}", e);
                            } else {
                                warn!(%peer, "connection error: {}", e);
                            }
                        }
                        drop(permit);
                    });
                }
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        Ok(())
    }
}

async fn accept(
    listener: &TcpListener,
    permits: &Arc<Semaphore>,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr, tokio::sync::OwnedSemaphorePermit)> {
    let permit = Arc::clone(permits)
        .acquire_owned()
        .await
        .map_err(|_| std::io::Error::other("connection limiter closed"))?;
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((stream, peer, permit))
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
