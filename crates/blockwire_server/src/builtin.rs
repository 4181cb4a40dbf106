//! Opcodes every server and link understands.

use crate::session::Session;
use blockwire_protocol::{
    OpcodeOptions, OpcodeRegistry, Payload, ProtocolResult, OPCODE_PING, OPCODE_RESPONSE,
};
use tracing::debug;

/// Registers `Response` and `Ping`.
///
/// # Errors
///
/// Fails if either opcode is already taken.
pub fn install(registry: &mut OpcodeRegistry<Session>) -> ProtocolResult<()> {
    registry.register(
        OPCODE_RESPONSE,
        OpcodeOptions::new("response").correlated(),
        |message: &mut Payload, session: &Session| {
            if let Some(id) = message.request_id() {
                if !session.queue().complete_request(id, message.take_data()) {
                    debug!(id, "response for a request that is not pending");
                }
            }
            Ok(())
        },
    )?;
    registry.register(
        OPCODE_PING,
        OpcodeOptions::new("ping").correlated(),
        |message: &mut Payload, session: &Session| {
            if let Some(id) = message.request_id() {
                session.reply(id, message.data());
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockwire_codec::BufferPool;
    use blockwire_protocol::{ReceiveLimits, Receiver};
    use std::net::SocketAddr;
    use std::sync::Arc;

    #[test]
    fn ping_is_answered_with_an_echo() {
        let mut registry = OpcodeRegistry::new();
        install(&mut registry).unwrap();
        let session = Session::new(SocketAddr::from(([127, 0, 0, 1], 1)), BufferPool::new(64), 4);
        let mut receiver = Receiver::new(Arc::new(registry), ReceiveLimits::new(), BufferPool::new(64));

        let mut ping = session.correlated_writer(OPCODE_PING);
        ping.write_bytes(b"echo me");
        ping.finish().unwrap();
        ping.set_request_id(3).unwrap();
        receiver.push_slice(&ping.to_vec());
        assert!(receiver.process(&session).unwrap().is_empty());

        let reply = session.queue().next_block().unwrap();
        assert_eq!(reply.as_slice()[0], OPCODE_RESPONSE);
        assert_eq!(&reply.as_slice()[5..7], &3u16.to_le_bytes());
        assert_eq!(&reply.as_slice()[7..], b"echo me");
    }

    #[test]
    fn builtins_cannot_be_installed_twice() {
        let mut registry = OpcodeRegistry::new();
        install(&mut registry).unwrap();
        assert!(install(&mut registry).is_err());
    }
}
