//! Multicast, fire-and-forget events.
//!
//! A generator lives on a provided interface and keeps the list of handlers
//! bound to it. Firing never blocks: each handler either runs in-line (no
//! mailbox, or fired from the handler's own thread) or is queued onto the
//! handler owner's event mailbox.

use crate::communication::mailbox::{run_handler, Handler, Mailbox, MailboxEntry, Reply};
use crate::core::payload::{Envelope, Payload, TypeDescriptor, TypeTag, Value};
use crate::core::result::ExecutionResult;
use crate::error::{MtaskError, MtaskResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Serializable summary of an event generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescription {
    pub name: String,
    pub payload: Option<TypeTag>,
}

/// Receives one event on behalf of a required interface (or a network forwarder).
pub struct EventHandler {
    id: u64,
    name: String,
    payload: Option<TypeDescriptor>,
    callback: Handler,
    mailbox: Option<Mailbox>,
}

impl EventHandler {
    pub fn new(
        name: &str,
        payload: Option<TypeDescriptor>,
        callback: Handler,
        mailbox: Option<Mailbox>,
    ) -> Self {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            payload,
            callback,
            mailbox,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_type(&self) -> Option<&TypeDescriptor> {
        self.payload.as_ref()
    }

    pub fn is_queued(&self) -> bool {
        self.mailbox.is_some()
    }

    /// Deliver one occurrence. Never blocks.
    pub fn deliver(&self, payload: Option<&dyn Value>) -> ExecutionResult {
        match (&self.payload, payload) {
            (None, _) => {}
            (Some(expected), Some(value)) if expected.matches_value(value) => {}
            (Some(expected), _) => {
                log::warn!(
                    "event handler '{}' expects {}; occurrence dropped",
                    self.name,
                    expected.tag()
                );
                return ExecutionResult::InvalidInputType;
            }
        }
        let payload = if self.payload.is_some() { payload } else { None };
        match &self.mailbox {
            Some(mailbox) if !mailbox.is_owner_thread() => {
                let entry = MailboxEntry::invoke(
                    &self.name,
                    self.callback.clone(),
                    payload.map(|p| p.clone_value()),
                    Reply::None,
                );
                mailbox.push(entry)
            }
            _ => match run_handler(&self.callback, payload) {
                Ok(_) => ExecutionResult::Succeeded,
                Err(message) => {
                    log::error!("event handler '{}' panicked: {}", self.name, message);
                    ExecutionResult::CommandFailed
                }
            },
        }
    }

    /// Deliver an occurrence received from another process.
    pub fn deliver_encoded(&self, payload: Option<&Envelope>) -> ExecutionResult {
        match (&self.payload, payload) {
            (Some(desc), Some(envelope)) => match desc.open(envelope) {
                Ok(value) => self.deliver(Some(value.as_ref())),
                Err(code) => code,
            },
            (None, _) => self.deliver(None),
            (Some(_), None) => ExecutionResult::InvalidInputType,
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queued", &self.is_queued())
            .finish()
    }
}

pub struct EventGenerator {
    name: String,
    payload: Option<TypeDescriptor>,
    handlers: RwLock<Vec<Arc<EventHandler>>>,
}

impl EventGenerator {
    pub fn new(name: &str, payload: Option<TypeDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            payload,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_type(&self) -> Option<&TypeDescriptor> {
        self.payload.as_ref()
    }

    pub fn describe(&self) -> EventDescription {
        EventDescription {
            name: self.name.clone(),
            payload: self.payload.as_ref().map(|d| d.tag().clone()),
        }
    }

    /// Append a handler to the fan-out list. Registering the same handler
    /// twice is rejected.
    pub fn add_handler(&self, handler: &Arc<EventHandler>) -> MtaskResult<()> {
        self.accepts(handler)?;
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.id == handler.id) {
            log::warn!(
                "handler '{}' already registered on event '{}'",
                handler.name,
                self.name
            );
            return Err(MtaskError::already_exists(format!(
                "handler '{}' on event '{}'",
                handler.name, self.name
            )));
        }
        handlers.push(handler.clone());
        Ok(())
    }

    /// Payload type check of `add_handler`
    pub fn accepts(&self, handler: &EventHandler) -> MtaskResult<()> {
        let expected = self.payload.as_ref().map(|d| d.tag());
        let offered = handler.payload.as_ref().map(|d| d.tag());
        if expected != offered {
            return Err(MtaskError::invalid_input(format!(
                "event '{}' carries {:?} but handler '{}' expects {:?}",
                self.name,
                expected.map(|t| t.as_str()),
                handler.name,
                offered.map(|t| t.as_str())
            )));
        }
        Ok(())
    }

    pub fn remove_handler(&self, handler_id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != handler_id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Fan the occurrence out to every handler. Per-handler failures are
    /// logged; the caller only learns about a payload type mismatch.
    pub fn fire(&self, payload: Option<&dyn Value>) -> ExecutionResult {
        if let Some(expected) = &self.payload {
            match payload {
                Some(value) if expected.matches_value(value) => {}
                _ => return ExecutionResult::InvalidInputType,
            }
        }
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            let result = handler.deliver(payload);
            if result.is_err() {
                log::warn!(
                    "event '{}' not delivered to '{}': {}",
                    self.name,
                    handler.name,
                    result
                );
            }
        }
        ExecutionResult::Succeeded
    }

    /// Fan out an occurrence received from another process. Each handler
    /// decodes the payload into its own type.
    pub fn fire_encoded(&self, payload: Option<&Envelope>) -> ExecutionResult {
        match (&self.payload, payload) {
            (None, _) => {}
            (Some(expected), Some(envelope)) if envelope.type_tag == *expected.tag() => {}
            _ => return ExecutionResult::InvalidInputType,
        }
        let payload = if self.payload.is_some() { payload } else { None };
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            let result = handler.deliver_encoded(payload);
            if result.is_err() {
                log::warn!(
                    "remote event '{}' not delivered to '{}': {}",
                    self.name,
                    handler.name,
                    result
                );
            }
        }
        ExecutionResult::Succeeded
    }
}

impl fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGenerator")
            .field("name", &self.name)
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Fires an event without payload
#[derive(Clone)]
pub struct EventVoid {
    generator: Arc<EventGenerator>,
}

impl EventVoid {
    pub(crate) fn new(generator: Arc<EventGenerator>) -> Self {
        Self { generator }
    }

    pub fn name(&self) -> &str {
        self.generator.name()
    }

    pub fn fire(&self) -> ExecutionResult {
        self.generator.fire(None)
    }
}

/// Fires an event carrying a `T`
pub struct EventWrite<T> {
    generator: Arc<EventGenerator>,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for EventWrite<T> {
    fn clone(&self) -> Self {
        Self {
            generator: self.generator.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Payload> EventWrite<T> {
    pub(crate) fn new(generator: Arc<EventGenerator>) -> Self {
        Self {
            generator,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.generator.name()
    }

    pub fn fire(&self, payload: &T) -> ExecutionResult {
        self.generator.fire(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
    }

    #[test]
    fn test_multicast_to_direct_handlers() {
        let generator = Arc::new(EventGenerator::new("Tick", None));
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        generator
            .add_handler(&Arc::new(EventHandler::new("Tick", None, counting(a.clone()), None)))
            .unwrap();
        generator
            .add_handler(&Arc::new(EventHandler::new("Tick", None, counting(b.clone()), None)))
            .unwrap();
        EventVoid::new(generator.clone()).fire();
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let generator = EventGenerator::new("Tick", None);
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(EventHandler::new("Tick", None, counting(count.clone()), None));
        generator.add_handler(&handler).unwrap();
        assert!(generator.add_handler(&handler).unwrap_err().is_already_exists());
        generator.fire(None);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(generator.remove_handler(handler.id()));
        assert!(!generator.remove_handler(handler.id()));
        generator.fire(None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_handler_runs_on_drain() {
        let mailbox = Mailbox::new("events", 4);
        let total = Arc::new(AtomicUsize::new(0));
        let sink = total.clone();
        let callback: Handler = Arc::new(move |p| {
            if let Some(v) = p.and_then(|p| p.as_any().downcast_ref::<usize>()) {
                sink.fetch_add(*v, Ordering::SeqCst);
            }
            None
        });
        let generator = Arc::new(EventGenerator::new("Moved", Some(TypeDescriptor::of::<usize>())));
        generator
            .add_handler(&Arc::new(EventHandler::new(
                "Moved",
                Some(TypeDescriptor::of::<usize>()),
                callback,
                Some(mailbox.clone()),
            )))
            .unwrap();

        let trigger = EventWrite::<usize>::new(generator);
        assert_eq!(trigger.fire(&4), ExecutionResult::Succeeded);
        assert_eq!(trigger.fire(&6), ExecutionResult::Succeeded);
        assert_eq!(total.load(Ordering::SeqCst), 0);
        mailbox.drain_all();
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_payload_type_checked() {
        let generator = EventGenerator::new("Moved", Some(TypeDescriptor::of::<u32>()));
        assert_eq!(generator.fire(Some(&1.0f32)), ExecutionResult::InvalidInputType);
        let handler = Arc::new(EventHandler::new(
            "Moved",
            Some(TypeDescriptor::of::<f32>()),
            Arc::new(|_| None),
            None,
        ));
        assert!(generator.add_handler(&handler).is_err());
    }

    #[test]
    fn test_encoded_delivery() {
        let got = Arc::new(AtomicUsize::new(0));
        let sink = got.clone();
        let handler = EventHandler::new(
            "Count",
            Some(TypeDescriptor::of::<u64>()),
            Arc::new(move |p| {
                if let Some(v) = p.and_then(|p| p.as_any().downcast_ref::<u64>()) {
                    sink.store(*v as usize, Ordering::SeqCst);
                }
                None
            }),
            None,
        );
        let envelope = Envelope::seal_typed(&77u64).unwrap();
        assert_eq!(handler.deliver_encoded(Some(&envelope)), ExecutionResult::Succeeded);
        assert_eq!(got.load(Ordering::SeqCst), 77);

        let wrong = Envelope::seal_typed(&"x".to_string()).unwrap();
        assert_eq!(
            handler.deliver_encoded(Some(&wrong)),
            ExecutionResult::InvalidInputType
        );
    }

    #[test]
    fn test_fire_encoded_through_remote_generator() {
        let got = Arc::new(AtomicUsize::new(0));
        let sink = got.clone();
        let generator =
            EventGenerator::new("Count", Some(TypeDescriptor::remote(TypeTag::of::<u64>())));
        generator
            .add_handler(&Arc::new(EventHandler::new(
                "Count",
                Some(TypeDescriptor::of::<u64>()),
                Arc::new(move |p| {
                    if let Some(v) = p.and_then(|p| p.as_any().downcast_ref::<u64>()) {
                        sink.fetch_add(*v as usize, Ordering::SeqCst);
                    }
                    None
                }),
                None,
            )))
            .unwrap();
        let envelope = Envelope::seal_typed(&3u64).unwrap();
        assert_eq!(generator.fire_encoded(Some(&envelope)), ExecutionResult::Succeeded);
        assert_eq!(got.load(Ordering::SeqCst), 3);
        let wrong = Envelope::seal_typed(&3u32).unwrap();
        assert_eq!(
            generator.fire_encoded(Some(&wrong)),
            ExecutionResult::InvalidInputType
        );
    }
}
