//! Notifications raised by the connection engines.
//!
//! Handlers are registered on an [EventHandlers] list and invoked synchronously, in registration
//! order, from the task that observed the event. Events of one connection are therefore never
//! reordered relative to the packets that caused them.
use crate::{publication::ApplicationMessage, reason_codes::ReasonCode, retained::RetainedChange};
use parking_lot::RwLock;
use std::sync::Arc;

/// Events of an [MqttClient](crate::MqttClient).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The broker accepted the connection.
    Connected { session_present: bool },

    /// The connection was lost or closed.
    ///
    /// `reason` carries the reason code of a DISCONNECT received from the broker, if any.
    Disconnected {
        reason: Option<ReasonCode>,
        was_connected: bool,
    },

    /// An application message arrived on a subscription.
    MessageReceived(ApplicationMessage),
}

/// Events of an [MqttBroker](crate::MqttBroker).
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: String,
        session_present: bool,
    },

    ClientDisconnected {
        client_id: String,

        /// True if the client sent a DISCONNECT that did not request the will.
        graceful: bool,
    },

    /// A session queue was full and a message had to be dropped.
    MessageDropped {
        client_id: String,
        message: ApplicationMessage,
    },

    /// A publication matched no subscription.
    ApplicationMessageNotConsumed {
        sender: Option<String>,
        message: ApplicationMessage,
    },

    SubscriptionChanged {
        client_id: String,
        subscribed: Vec<String>,
        unsubscribed: Vec<String>,
    },

    RetainedMessageChanged {
        topic: String,
        change: RetainedChange,
    },
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An ordered list of event handlers.
pub struct EventHandlers<E> {
    handlers: RwLock<Vec<Handler<E>>>,
}

impl<E> Default for EventHandlers<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventHandlers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It is called after all previously registered handlers.
    pub fn add(&self, handler: impl Fn(&E) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Invoke every handler with the event.
    ///
    /// # Note
    /// The handler list is snapshotted first, so handlers may register further handlers.
    pub fn emit(&self, event: &E) {
        let handlers = self.handlers.read().clone();
        for handler in handlers.iter() {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn handlers_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handlers = EventHandlers::<ClientEvent>::new();

        for index in 0..3 {
            let calls = calls.clone();
            handlers.add(move |event| {
                if let ClientEvent::Connected { .. } = event {
                    calls.lock().push(index);
                }
            });
        }

        handlers.emit(&ClientEvent::Connected {
            session_present: false,
        });
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn handler_may_register_handlers() {
        let handlers = Arc::new(EventHandlers::<BrokerEvent>::new());
        let inner = handlers.clone();
        handlers.add(move |_| inner.add(|_| {}));

        handlers.emit(&BrokerEvent::ClientDisconnected {
            client_id: "a".into(),
            graceful: true,
        });
        assert_eq!(handlers.len(), 2);
    }
}
