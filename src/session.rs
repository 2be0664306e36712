//! Per-client session state held by the broker.
use crate::{
    config::OverflowStrategy,
    delivery::DeliveryEngine,
    properties::Property,
    publication::ApplicationMessage,
    reason_codes::ReasonCode,
    topic::TopicFilter,
    types::SubscriptionOptions,
    Will,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Duration, Instant};

/// A subscription of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub filter: TopicFilter,

    /// The options requested by the subscriber, with the QoS reduced to the granted QoS.
    pub options: SubscriptionOptions,

    /// The MQTT v5 subscription identifier.
    pub identifier: Option<u32>,
}

/// A message waiting to be sent to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// The message with the QoS and retain flag of this delivery.
    pub message: ApplicationMessage,

    /// Identifiers of the subscriptions that matched.
    pub subscription_identifiers: Vec<u32>,

    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Build the message for transmission, or `None` if it expired while queued.
    ///
    /// The remaining lifetime replaces the message expiry interval.
    pub fn into_deliverable(mut self, now: Instant) -> Option<ApplicationMessage> {
        let elapsed = now.saturating_duration_since(self.enqueued_at).as_secs();
        if let Some(interval) = self.message.message_expiry_interval() {
            if elapsed >= interval as u64 {
                return None;
            }

            for prop in self.message.properties.iter_mut() {
                if let Property::MessageExpiryInterval(remaining) = prop {
                    *remaining = interval - elapsed as u32;
                }
            }
        }

        self.message.properties.extend(
            self.subscription_identifiers
                .iter()
                .map(|id| Property::SubscriptionIdentifier(*id)),
        );

        Some(self.message)
    }
}

/// The connection currently attached to a session.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub id: u64,
    stop: mpsc::UnboundedSender<ReasonCode>,
}

impl ConnectionHandle {
    pub fn new(id: u64) -> (Self, mpsc::UnboundedReceiver<ReasonCode>) {
        let (stop, receiver) = mpsc::unbounded_channel();
        (Self { id, stop }, receiver)
    }

    /// Ask the connection to close with a DISCONNECT carrying the provided reason.
    pub fn stop(&self, reason: ReasonCode) {
        self.stop.send(reason).ok();
    }
}

/// The state of one client identifier.
pub struct Session {
    client_id: String,
    pub(crate) subscriptions: HashMap<String, Subscription>,
    queue: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
    pub(crate) will: Option<Will>,
    pub(crate) persistent: bool,
    pub(crate) expiry_interval: u32,
    pub(crate) connection: Option<ConnectionHandle>,
    pub(crate) disconnected_at: Option<Instant>,
    pub(crate) engine: Option<DeliveryEngine>,

    /// Delivery state owed by a displaced connection to the connection that took over, keyed
    /// by the id of the displaced connection.
    pub(crate) handoff: Option<(u64, oneshot::Sender<DeliveryEngine>)>,
    pub(crate) epoch: u64,
    created_at: Instant,
}

impl Session {
    pub(crate) fn new(client_id: impl Into<String>, persistent: bool, expiry_interval: u32) -> Self {
        Self {
            client_id: client_id.into(),
            subscriptions: HashMap::new(),
            queue: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            will: None,
            persistent,
            expiry_interval,
            connection: None,
            disconnected_at: None,
            engine: None,
            handoff: None,
            epoch: 0,
            created_at: Instant::now(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// The number of messages waiting for delivery.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    /// Signalled whenever a message is queued.
    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Queue a message for delivery.
    ///
    /// # Returns
    /// The message that was dropped because the queue was full, if any.
    pub(crate) fn enqueue(
        &mut self,
        message: QueuedMessage,
        limit: usize,
        strategy: OverflowStrategy,
    ) -> Option<QueuedMessage> {
        let mut dropped = None;

        if self.queue.len() >= limit {
            match strategy {
                OverflowStrategy::DropNewMessage => return Some(message),
                OverflowStrategy::DropOldestQueuedMessage => dropped = self.queue.pop_front(),
            }
        }

        if limit > 0 {
            self.queue.push_back(message);
            self.notify.notify_one();
        } else {
            dropped = Some(message);
        }

        dropped
    }

    /// Take the next deliverable message, discarding expired ones.
    pub(crate) fn next_message(&mut self, now: Instant) -> Option<ApplicationMessage> {
        while let Some(queued) = self.queue.pop_front() {
            if let Some(message) = queued.into_deliverable(now) {
                return Some(message);
            }
        }

        None
    }

    pub(crate) fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// True if the session outlived its expiry interval after disconnecting.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        match self.disconnected_at {
            Some(_) if self.expiry_interval == u32::MAX => false,
            Some(at) => {
                now.saturating_duration_since(at) >= Duration::from_secs(self.expiry_interval as u64)
            }
            None => false,
        }
    }
}

/// A snapshot of a session for administration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub client_id: String,
    pub connected: bool,
    pub persistent: bool,
    pub subscriptions: Vec<String>,
    pub pending_messages: usize,
}

impl From<&Session> for SessionStatus {
    fn from(session: &Session) -> Self {
        let mut subscriptions: Vec<String> = session.subscriptions.keys().cloned().collect();
        subscriptions.sort();

        Self {
            client_id: session.client_id.clone(),
            connected: session.is_connected(),
            persistent: session.persistent,
            subscriptions,
            pending_messages: session.queue.len(),
        }
    }
}
