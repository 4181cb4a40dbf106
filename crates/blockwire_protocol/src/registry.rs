//! Opcode registry.
//!
//! Maps each opcode byte to a message type, its pool and its handler. The
//! registry is built once at startup and shared by every connection.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Header, Message, MessagePool, Pooled, Step, StepInput};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A handler future the connection driver must spawn.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Registration options for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeOptions {
    /// Name used in logs.
    pub name: &'static str,
    /// Whether the opcode carries a payload length and request id.
    pub correlated: bool,
}

impl OpcodeOptions {
    /// Options for an uncorrelated opcode.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            correlated: false,
        }
    }

    /// Marks the opcode as correlated.
    #[must_use]
    pub const fn correlated(mut self) -> Self {
        self.correlated = true;
        self
    }
}

enum Handler<M: Message, C> {
    Sync(Box<dyn Fn(&mut M, &C) -> ProtocolResult<()> + Send + Sync>),
    Async(Box<dyn Fn(Pooled<M>, &C) -> Task + Send + Sync>),
}

/// A message being parsed, with its handler attached.
pub(crate) trait ActiveMessage<C>: Send {
    fn begin(&mut self, header: &Header);

    fn step(&mut self, phase: u16, input: StepInput<'_, '_>) -> ProtocolResult<Step>;

    /// Runs a sync handler inline, or returns the async handler's future.
    fn dispatch(self: Box<Self>, context: &C) -> ProtocolResult<Option<Task>>;
}

struct Active<M: Message, C> {
    message: Pooled<M>,
    handler: Arc<Handler<M, C>>,
}

impl<M: Message, C: 'static> ActiveMessage<C> for Active<M, C> {
    fn begin(&mut self, header: &Header) {
        self.message.begin(header);
    }

    fn step(&mut self, phase: u16, input: StepInput<'_, '_>) -> ProtocolResult<Step> {
        self.message.step(phase, input)
    }

    fn dispatch(self: Box<Self>, context: &C) -> ProtocolResult<Option<Task>> {
        let Active {
            mut message,
            handler,
        } = *self;
        match &*handler {
            Handler::Sync(handle) => {
                handle(&mut message, context)?;
                Ok(None)
            }
            Handler::Async(handle) => Ok(Some(handle(message, context))),
        }
    }
}

trait Factory<C>: Send + Sync {
    fn instantiate(&self) -> Box<dyn ActiveMessage<C>>;
}

struct TypedFactory<M: Message, C> {
    pool: MessagePool<M>,
    handler: Arc<Handler<M, C>>,
}

impl<M: Message, C: 'static> Factory<C> for TypedFactory<M, C> {
    fn instantiate(&self) -> Box<dyn ActiveMessage<C>> {
        Box::new(Active {
            message: self.pool.get(),
            handler: Arc::clone(&self.handler),
        })
    }
}

pub(crate) struct Entry<C> {
    options: OpcodeOptions,
    asynchronous: bool,
    factory: Box<dyn Factory<C>>,
}

impl<C> Entry<C> {
    pub(crate) fn options(&self) -> OpcodeOptions {
        self.options
    }

    pub(crate) fn instantiate(&self) -> Box<dyn ActiveMessage<C>> {
        self.factory.instantiate()
    }
}

/// Opcode table shared by every connection of a server or link.
///
/// `C` is the per-connection context handed to handlers.
pub struct OpcodeRegistry<C> {
    entries: Vec<Option<Entry<C>>>,
}

impl<C: Send + Sync + 'static> OpcodeRegistry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: (0..=u8::MAX).map(|_| None).collect(),
        }
    }

    /// Registers a handler that runs inline on the read loop.
    ///
    /// The message returns to its pool as soon as the handler returns. A
    /// handler error desyncs the connection.
    ///
    /// # Errors
    ///
    /// Returns an error for opcode 0 or an already registered code.
    pub fn register<M, F>(&mut self, code: u8, options: OpcodeOptions, handler: F) -> ProtocolResult<()>
    where
        M: Message,
        F: Fn(&mut M, &C) -> ProtocolResult<()> + Send + Sync + 'static,
    {
        self.insert::<M>(code, options, false, Handler::Sync(Box::new(handler)))
    }

    /// Registers a handler that receives the owned message and returns a
    /// future. The connection driver spawns the future; the message goes
    /// back to its pool when the future drops it.
    ///
    /// # Errors
    ///
    /// Returns an error for opcode 0 or an already registered code.
    pub fn register_async<M, F, Fut>(
        &mut self,
        code: u8,
        options: OpcodeOptions,
        handler: F,
    ) -> ProtocolResult<()>
    where
        M: Message,
        C: Clone,
        F: Fn(Pooled<M>, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed = move |message: Pooled<M>, context: &C| -> Task {
            Box::pin(handler(message, context.clone()))
        };
        self.insert::<M>(code, options, true, Handler::Async(Box::new(boxed)))
    }

    fn insert<M: Message>(
        &mut self,
        code: u8,
        options: OpcodeOptions,
        asynchronous: bool,
        handler: Handler<M, C>,
    ) -> ProtocolResult<()> {
        if code == 0 {
            return Err(ProtocolError::ReservedOpcode(code));
        }
        let slot = &mut self.entries[usize::from(code)];
        if let Some(existing) = slot {
            return Err(ProtocolError::DuplicateOpcode {
                code,
                existing: existing.options.name,
            });
        }
        *slot = Some(Entry {
            options,
            asynchronous,
            factory: Box::new(TypedFactory {
                pool: MessagePool::<M>::default(),
                handler: Arc::new(handler),
            }),
        });
        Ok(())
    }
}

impl<C> OpcodeRegistry<C> {
    pub(crate) fn entry(&self, code: u8) -> Option<&Entry<C>> {
        self.entries.get(usize::from(code))?.as_ref()
    }

    /// Returns the options an opcode was registered with.
    #[must_use]
    pub fn options(&self, code: u8) -> Option<OpcodeOptions> {
        self.entry(code).map(Entry::options)
    }

    /// Returns true if the opcode's handler is asynchronous.
    #[must_use]
    pub fn is_async(&self, code: u8) -> bool {
        self.entry(code).is_some_and(|e| e.asynchronous)
    }

    /// Returns the registered codes in ascending order.
    pub fn codes(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries
            .iter()
            .zip(0..=u8::MAX)
            .filter_map(|(entry, code)| entry.as_ref().map(|_| code))
    }

    /// Returns the number of registered opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Send + Sync + 'static> Default for OpcodeRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for OpcodeRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .codes()
            .filter_map(|code| self.options(code).map(|o| (code, o.name)))
            .collect();
        f.debug_struct("OpcodeRegistry").field("opcodes", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[test]
    fn opcode_zero_is_reserved() {
        let mut registry: OpcodeRegistry<()> = OpcodeRegistry::new();
        let err = registry
            .register(0, OpcodeOptions::new("zero"), |_: &mut Payload, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ReservedOpcode(0)));
    }

    #[test]
    fn duplicate_registration_names_the_existing_entry() {
        let mut registry: OpcodeRegistry<()> = OpcodeRegistry::new();
        registry
            .register(5, OpcodeOptions::new("first"), |_: &mut Payload, _| Ok(()))
            .unwrap();
        let err = registry
            .register_async(5, OpcodeOptions::new("second"), |_: Pooled<Payload>, _| async {})
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DuplicateOpcode {
                code: 5,
                existing: "first"
            }
        ));
    }

    #[test]
    fn options_and_codes_are_reported() {
        let mut registry: OpcodeRegistry<()> = OpcodeRegistry::new();
        registry
            .register(
                9,
                OpcodeOptions::new("nine").correlated(),
                |_: &mut Payload, _| Ok(()),
            )
            .unwrap();
        registry
            .register_async(3, OpcodeOptions::new("three"), |_: Pooled<Payload>, _| async {})
            .unwrap();

        assert_eq!(registry.codes().collect::<Vec<_>>(), vec![3, 9]);
        assert!(registry.options(9).unwrap().correlated);
        assert!(registry.is_async(3));
        assert!(!registry.is_async(9));
        assert_eq!(registry.len(), 2);
        assert!(registry.options(4).is_none());
    }
}
