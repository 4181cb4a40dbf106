//! Serve command implementation.

use blockwire_protocol::OpcodeRegistry;
use blockwire_server::{ConnectionMode, Server, ServerConfig};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Runs a server answering the builtin opcodes until ctrl-c.
pub fn run(
    bind: SocketAddr,
    raw: bool,
    max_connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if raw {
        ConnectionMode::Raw
    } else {
        ConnectionMode::WebSocket
    };
    let config = ServerConfig::new(bind)
        .with_mode(mode)
        .with_max_connections(max_connections);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let server = Server::bind(config, OpcodeRegistry::new()).await?;
        println!("Listening on {}", server.local_addr()?);

        let (stop, stopped) = oneshot::channel();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(e) => {
                    warn!("cannot listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
            }
            let _ = stop.send(());
        });
        server.run_until(stopped).await
    })?;
    Ok(())
}
