//! # Blockwire Server
//!
//! tokio socket driver for the blockwire protocol.
//!
//! This crate provides:
//! - A TCP listener that upgrades browser clients over the websocket handshake
//!   or speaks the raw protocol directly
//! - One read loop and one send pump per connection
//! - [`Link`], an outbound raw connection for inter-process traffic
//! - The builtin `Response` and `Ping` opcodes
//!
//! # Architecture
//!
//! Every connection owns a [`Receiver`](blockwire_protocol::Receiver) fed with
//! pooled blocks straight from the socket and a
//! [`SendQueue`](blockwire_protocol::SendQueue) drained by the pump task.
//! Handlers get a [`Session`] to answer through; async handlers run as
//! separate tasks.
//!
//! A protocol error kills the connection: the stream cannot be
//! resynchronized, so every pending request is failed and the socket closed.
//!
//! ```rust,no_run
//! use blockwire_protocol::{OpcodeOptions, OpcodeRegistry, Payload};
//! use blockwire_server::{ConnectionMode, Server, ServerConfig, Session};
//!
//! # async fn run() -> blockwire_server::ServerResult<()> {
//! let mut registry = OpcodeRegistry::new();
//! registry.register(
//!     10,
//!     OpcodeOptions::new("echo").correlated(),
//!     |message: &mut Payload, session: &Session| {
//!         if let Some(id) = message.request_id() {
//!             session.reply(id, message.data());
//!         }
//!         Ok(())
//!     },
//! )?;
//!
//! let config = ServerConfig::default().with_mode(ConnectionMode::Raw);
//! Server::bind(config, registry).await?.run().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod builtin;
mod config;
mod connection;
mod error;
mod link;
mod server;
mod session;

pub use config::{ConnectionMode, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use link::Link;
pub use server::Server;
pub use session::Session;
