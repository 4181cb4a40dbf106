//! End-to-end tests over real sockets.

use blockwire_codec::Writer;
use blockwire_protocol::websocket::{self, OPCODE_BINARY, OPCODE_PONG};
use blockwire_protocol::{
    OpcodeOptions, OpcodeRegistry, Payload, Pooled, OPCODE_PING, OPCODE_RESPONSE,
};
use blockwire_server::{ConnectionMode, Link, Server, ServerConfig, ServerError, Session};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const OPCODE_UPPER: u8 = 10;
const OPCODE_SILENT: u8 = 11;

const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

fn registry() -> OpcodeRegistry<Session> {
    let mut registry = OpcodeRegistry::new();
    registry
        .register_async(
            OPCODE_UPPER,
            OpcodeOptions::new("upper").correlated(),
            |message: Pooled<Payload>, session: Session| async move {
                tokio::task::yield_now().await;
                if let Some(id) = message.request_id() {
                    session.reply(id, &message.data().to_ascii_uppercase());
                }
            },
        )
        .unwrap();
    registry
        .register(
            OPCODE_SILENT,
            OpcodeOptions::new("silent").correlated(),
            |_: &mut Payload, _: &Session| Ok(()),
        )
        .unwrap();
    registry
}

async fn start(mode: ConnectionMode) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))).with_mode(mode);
    let server = Server::bind(config, registry()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel();
    let handle = tokio::spawn(async move {
        server.run_until(stopped).await.unwrap();
    });
    (addr, stop, handle)
}

async fn link(addr: SocketAddr, request_ids: u16) -> Link {
    let config = ServerConfig::default().with_request_ids(request_ids);
    Link::connect(addr, OpcodeRegistry::new(), &config).await.unwrap()
}

#[tokio::test]
async fn ping_round_trip_over_a_link() {
    let (addr, stop, server) = start(ConnectionMode::Raw).await;
    let link = link(addr, 16).await;

    let echoed = link.ping(b"are you there").await.unwrap();
    assert_eq!(&echoed[..], b"are you there");
    assert!(link.ping(b"").await.unwrap().is_empty());

    link.close().await.unwrap();
    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn async_handler_answers_a_request() {
    let (addr, stop, server) = start(ConnectionMode::Raw).await;
    let link = link(addr, 16).await;

    let mut writer = link.session().correlated_writer(OPCODE_UPPER);
    writer.write_bytes(b"quiet please");
    let reply = link.request(writer).await.unwrap();
    assert_eq!(&reply[..], b"QUIET PLEASE");

    link.close().await.unwrap();
    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn requests_beyond_the_id_supply_wait_their_turn() {
    let (addr, stop, server) = start(ConnectionMode::Raw).await;
    let link = link(addr, 2).await;

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let session = link.session().clone();
            tokio::spawn(async move {
                let mut writer = session.correlated_writer(OPCODE_UPPER);
                writer.write_bytes(format!("call {i}").as_bytes());
                session.request(writer).await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply, format!("CALL {i}").into_bytes());
    }
    assert_eq!(link.session().queue().pending_requests(), 0);

    link.close().await.unwrap();
    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn server_shutdown_fails_pending_link_requests() {
    let (addr, stop, server) = start(ConnectionMode::Raw).await;
    let link = link(addr, 4).await;

    let pending = {
        let session = link.session().clone();
        tokio::spawn(async move {
            let mut writer = session.correlated_writer(OPCODE_SILENT);
            writer.write_bytes(b"no answer");
            session.request(writer).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(()).unwrap();
    server.await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_collapsed(), "unexpected error: {err}");
    assert!(!link.is_open());
}

#[tokio::test]
async fn unknown_opcode_kills_the_connection() {
    let (addr, stop, server) = start(ConnectionMode::Raw).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[200, 1, 2, 3]).await.unwrap();

    assert_closed(&mut stream).await;

    stop.send(()).unwrap();
    server.await.unwrap();
}

/// The server may reset rather than close when it kills a connection.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(!matches!(read, Ok(n) if n > 0), "unexpected bytes: {read:?}");
}

const UPGRADE: &str = "GET /socket HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are never masked");
    let len = usize::from(header[1] & 0x7f);
    assert!(len < 126);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
}

#[tokio::test]
async fn websocket_client_pings_through_the_upgrade() {
    let (addr, stop, server) = start(ConnectionMode::WebSocket).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    let mut ping = Writer::start_correlated(OPCODE_PING);
    ping.write_bytes(b"over the web");
    ping.finish().unwrap();
    ping.set_request_id(7).unwrap();
    let frame = websocket::masked_frame(OPCODE_BINARY, &ping.to_vec(), KEY);
    stream.write_all(&frame).await.unwrap();

    let (first, payload) = read_frame(&mut stream).await;
    assert_eq!(first, 0x80 | OPCODE_BINARY);
    assert_eq!(payload[0], OPCODE_RESPONSE);
    assert_eq!(&payload[1..5], &12u32.to_le_bytes());
    assert_eq!(&payload[5..7], &7u16.to_le_bytes());
    assert_eq!(&payload[7..], b"over the web");

    let control = websocket::masked_frame(websocket::OPCODE_PING, b"hi", KEY);
    stream.write_all(&control).await.unwrap();
    let (first, payload) = read_frame(&mut stream).await;
    assert_eq!(first, 0x80 | OPCODE_PONG);
    assert_eq!(payload, b"hi");

    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn upgrade_without_a_key_is_refused() {
    let (addr, stop, server) = start(ConnectionMode::WebSocket).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();

    assert_closed(&mut stream).await;

    stop.send(()).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn link_to_nowhere_fails_with_io() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = Link::connect(addr, OpcodeRegistry::new(), &ServerConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Io(_)));
}
