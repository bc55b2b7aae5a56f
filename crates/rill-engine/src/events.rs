//! Engine event subscriptions

use rill_core::{ApplyReport, OperationBatch, RuntimeValue};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Event names an application can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A recoverable guest error
    Error,
    /// The sandbox became unusable; the engine destroys itself next
    FatalError,
    /// `__sendEventToHost(name, payload)` from the guest
    Message,
    /// A batch was applied to the receiver
    Operation,
    /// The engine was destroyed
    Destroy,
}

impl EventKind {
    /// Subscription name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Error => "error",
            EventKind::FatalError => "fatalError",
            EventKind::Message => "message",
            EventKind::Operation => "operation",
            EventKind::Destroy => "destroy",
        }
    }
}

/// Event payloads
#[derive(Clone)]
pub enum EngineEvent {
    /// Recoverable error
    Error {
        /// Error description
        message: String,
    },
    /// Unrecoverable error
    FatalError {
        /// Error description
        message: String,
    },
    /// Guest message
    Message {
        /// Event name chosen by the guest
        name: String,
        /// Payload, decoded on the host side
        payload: RuntimeValue,
    },
    /// Applied batch
    Operation {
        /// The batch as applied
        batch: Rc<OperationBatch>,
        /// What the receiver did with it
        report: ApplyReport,
    },
    /// Engine destroyed
    Destroy,
}

impl EngineEvent {
    /// Subscription this event is delivered to
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Error { .. } => EventKind::Error,
            EngineEvent::FatalError { .. } => EventKind::FatalError,
            EngineEvent::Message { .. } => EventKind::Message,
            EngineEvent::Operation { .. } => EventKind::Operation,
            EngineEvent::Destroy => EventKind::Destroy,
        }
    }
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Error { message } => f.debug_struct("Error").field("message", message).finish(),
            EngineEvent::FatalError { message } => f.debug_struct("FatalError").field("message", message).finish(),
            EngineEvent::Message { name, payload } => f
                .debug_struct("Message")
                .field("name", name)
                .field("payload", payload)
                .finish(),
            EngineEvent::Operation { batch, report } => f
                .debug_struct("Operation")
                .field("batch_id", &batch.batch_id)
                .field("report", report)
                .finish(),
            EngineEvent::Destroy => f.write_str("Destroy"),
        }
    }
}

/// Handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(&EngineEvent)>;

/// Listener lists per event kind
#[derive(Default)]
pub struct EventBus {
    listeners: RefCell<Vec<(ListenerId, EventKind, Listener)>>,
    next_id: Cell<u64>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind
    pub fn on(&self, kind: EventKind, listener: impl Fn(&EngineEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, kind, Rc::new(listener)));
        id
    }

    /// Unsubscribe; false if the listener was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver an event to its listeners, in subscription order
    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let targets: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| l.clone())
            .collect();
        for listener in targets {
            listener(event);
        }
    }

    /// Number of listeners for a kind
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.borrow().iter().filter(|(_, k, _)| *k == kind).count()
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_matching_listeners_only() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        bus.on(EventKind::Error, move |event| {
            if let EngineEvent::Error { message } = event {
                log.borrow_mut().push(message.clone());
            }
        });
        bus.emit(&EngineEvent::Error { message: "a".into() });
        bus.emit(&EngineEvent::Destroy);
        assert_eq!(*seen.borrow(), vec!["a".to_string()]);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let id = bus.on(EventKind::Destroy, move |_| counter.set(counter.get() + 1));
        bus.emit(&EngineEvent::Destroy);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&EngineEvent::Destroy);
        assert_eq!(hits.get(), 1);
        assert_eq!(bus.listener_count(EventKind::Destroy), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = Rc::new(EventBus::new());
        let slot = Rc::new(Cell::new(None));
        let (inner_bus, inner_slot) = (bus.clone(), slot.clone());
        let id = bus.on(EventKind::Destroy, move |_| {
            if let Some(id) = inner_slot.get() {
                inner_bus.off(id);
            }
        });
        slot.set(Some(id));
        bus.emit(&EngineEvent::Destroy);
        assert_eq!(bus.listener_count(EventKind::Destroy), 0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::FatalError.as_str(), "fatalError");
        assert_eq!(EngineEvent::Destroy.kind(), EventKind::Destroy);
    }
}
