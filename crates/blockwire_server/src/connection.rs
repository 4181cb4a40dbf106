//! Per-connection read loop and send pump.

use crate::config::ConnectionMode;
use crate::error::{ServerError, ServerResult};
use crate::session::Session;
use blockwire_codec::{Block, BufferPool, Chain};
use blockwire_protocol::websocket::{self, OPCODE_CLOSE, OPCODE_PONG};
use blockwire_protocol::{
    Control, FrameDecoder, Framing, Handshake, HandshakeStatus, OpcodeRegistry, Outgoing,
    ReceiveLimits, Receiver,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Settings a connection needs from the server or link config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionSettings {
    pub mode: ConnectionMode,
    pub handshake_limit: usize,
    pub limits: ReceiveLimits,
}

enum ReadMode {
    Handshake { handshake: Handshake, window: Chain },
    WebSocket(FrameDecoder),
    Raw,
}

/// Why the read loop stopped.
enum Stop {
    Closed(&'static str),
    Failed(ServerError),
}

/// Drives one connection until the peer leaves, the protocol desyncs or
/// `shutdown` flips.
#[instrument(skip_all, fields(session = %session.id(), peer = %session.peer()))]
pub(crate) async fn drive(
    stream: TcpStream,
    session: Session,
    registry: Arc<OpcodeRegistry<Session>>,
    settings: ConnectionSettings,
    mut shutdown: watch::Receiver<bool>,
) -> ServerResult<()> {
    debug!(mode = ?settings.mode, "connection open");
    let (mut reader, writer) = stream.into_split();
    let pump = tokio::spawn(pump(writer, session.clone()));

    let pool = session.pool().clone();
    let mut receiver = Receiver::new(registry, settings.limits, pool.clone());
    let mut mode = match settings.mode {
        ConnectionMode::WebSocket => ReadMode::Handshake {
            handshake: Handshake::new(settings.handshake_limit, pool.clone()),
            window: Chain::new(pool.clone()),
        },
        ConnectionMode::Raw => ReadMode::Raw,
    };

    let stop = loop {
        let block = tokio::select! {
            read = read_block(&mut reader, &pool) => match read {
                Ok(block) if block.is_empty() => break Stop::Closed("peer closed"),
                Ok(block) => block,
                Err(err) => break Stop::Failed(err.into()),
            },
            _ = shutdown.changed() => break Stop::Closed("server shutting down"),
        };
        match handle_block(block, &mut mode, &mut receiver, &session) {
            Ok(None) => {}
            Ok(Some(reason)) => break Stop::Closed(reason),
            Err(err) => break Stop::Failed(err),
        }
    };

    let result = match stop {
        Stop::Closed(reason) => {
            debug!(reason, "connection closed");
            session.close(reason);
            Ok(())
        }
        Stop::Failed(err) => {
            warn!(error = %err, "killing connection");
            session.close(&err.to_string());
            Err(err)
        }
    };
    match pump.await {
        Ok(Err(err)) => debug!(error = %err, "send pump stopped"),
        Err(err) => warn!(error = %err, "send pump panicked"),
        Ok(Ok(())) => {}
    }
    result
}

async fn read_block(reader: &mut OwnedReadHalf, pool: &BufferPool) -> std::io::Result<Block> {
    let mut block = pool.get();
    let n = reader.read(block.spare_mut()).await?;
    block.advance(n);
    Ok(block)
}

/// Feeds one received block through the current mode. Returns a reason
/// when the peer asked to close.
fn handle_block(
    block: Block,
    mode: &mut ReadMode,
    receiver: &mut Receiver<Session>,
    session: &Session,
) -> ServerResult<Option<&'static str>> {
    let mut data = Chain::new(session.pool().clone());
    let mut controls = Vec::new();
    match mode {
        ReadMode::Raw => receiver.push_block(block),
        ReadMode::WebSocket(decoder) => {
            controls = decoder.decode(block, &mut data)?;
        }
        ReadMode::Handshake { handshake, window } => {
            window.push(block);
            let mut segment = window.segment();
            let status = handshake.feed(&mut segment)?;
            let used = segment.consumed();
            drop(segment);
            window.consume(used);

            if let HandshakeStatus::Complete { accept } = status {
                debug!("websocket upgrade complete");
                let response = websocket_response(session, &accept);
                session.queue().send(Outgoing::Raw(response));
                session.queue().set_framing(Framing::WebSocket);

                let mut decoder = FrameDecoder::new();
                while let Some(rest) = window.pop_front() {
                    controls.extend(decoder.decode(rest, &mut data)?);
                }
                *mode = ReadMode::WebSocket(decoder);
            }
        }
    }
    receiver.push(data);

    for task in receiver.process(session)? {
        tokio::spawn(task);
    }

    for control in controls {
        match control {
            Control::Ping(payload) => {
                let pong = websocket::control_frame(OPCODE_PONG, &payload);
                session
                    .queue()
                    .send(Outgoing::Raw(Chain::from_slice(session.pool().clone(), &pong)));
            }
            Control::Pong => {}
            Control::Close => {
                let close = websocket::control_frame(OPCODE_CLOSE, &[]);
                session
                    .queue()
                    .send(Outgoing::Raw(Chain::from_slice(session.pool().clone(), &close)));
                return Ok(Some("websocket close"));
            }
        }
    }
    Ok(None)
}

fn websocket_response(session: &Session, accept: &str) -> Chain {
    let response = blockwire_protocol::handshake::response(accept);
    Chain::from_slice(session.pool().clone(), response.as_bytes())
}

/// Writes queued blocks one at a time, parking when the queue is idle.
async fn pump(mut writer: OwnedWriteHalf, session: Session) -> std::io::Result<()> {
    loop {
        while let Some(block) = session.queue().next_block() {
            if let Err(err) = writer.write_all(block.as_slice()).await {
                session.close(&format!("send failed: {err}"));
                return Err(err);
            }
        }
        if !session.is_open() {
            break;
        }
        session.notified().await;
    }
    writer.shutdown().await
}
