//! A client that keeps itself connected.
//!
//! # Design
//! A background task owns the connection. It connects whenever the client is disconnected,
//! restores subscriptions if the broker did not resume the session, and then drains the queue of
//! publications accepted while offline. Publications and subscription changes only touch local
//! state and wake the task, so they never fail because the broker is unreachable.
use crate::{
    config::{ManagedClientOptions, OverflowStrategy},
    events::{ClientEvent, EventHandlers},
    logging::Logger,
    mqtt_client::MqttClient,
    publication::ApplicationMessage,
    reason_codes::ReasonCode,
    storage::Storage,
    topic,
    transport::Transport,
    types::TopicSubscription,
    Error,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Default)]
struct SubscriptionChanges {
    subscribe: Vec<TopicSubscription>,
    unsubscribe: Vec<String>,
}

struct ManagedInner {
    client: MqttClient,
    reconnect_delay: Duration,
    connection_check_interval: Duration,
    max_pending: usize,
    overflow: OverflowStrategy,

    /// Publications waiting for a connection, tagged with a sequence number.
    pending: Mutex<VecDeque<(u64, ApplicationMessage)>>,
    next_sequence: Mutex<u64>,

    /// Every subscription the application requested, by filter.
    subscriptions: Mutex<HashMap<String, TopicSubscription>>,
    changes: Mutex<SubscriptionChanges>,
    storage: Mutex<Option<Arc<dyn Storage>>>,
    wake: Notify,
    log: Logger,
}

/// An [MqttClient] that reconnects on its own and queues publications while disconnected.
pub struct ManagedClient {
    inner: Arc<ManagedInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedClient {
    pub fn new(transport: impl Transport + 'static, options: ManagedClientOptions) -> Self {
        let log = options.client.logger.with_source("managed");
        let inner = Arc::new(ManagedInner {
            client: MqttClient::new(transport, options.client),
            reconnect_delay: options.reconnect_delay,
            connection_check_interval: options.connection_check_interval,
            max_pending: options.max_pending_messages,
            overflow: options.overflow_strategy,
            pending: Mutex::new(VecDeque::new()),
            next_sequence: Mutex::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            changes: Mutex::new(SubscriptionChanges::default()),
            storage: Mutex::new(None),
            wake: Notify::new(),
            log,
        });

        // A lost connection is noticed immediately instead of at the next connection check.
        let weak: Weak<ManagedInner> = Arc::downgrade(&inner);
        inner.client.events().add(move |event| {
            if let ClientEvent::Disconnected { .. } = event {
                if let Some(inner) = weak.upgrade() {
                    inner.wake.notify_one();
                }
            }
        });

        Self {
            inner,
            task: Mutex::new(None),
        }
    }

    /// Save the publication queue to `storage` whenever it changes.
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        *self.inner.storage.lock() = Some(storage);
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &MqttClient {
        &self.inner.client
    }

    pub fn events(&self) -> &EventHandlers<ClientEvent> {
        self.inner.client.events()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    /// The number of publications not yet handed to the connection.
    pub fn pending_messages(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Start the connection task.
    ///
    /// Publications saved to storage by a previous run are queued ahead of any publication made
    /// since construction.
    pub async fn start(&self) -> Result<(), Error> {
        if self.is_started() {
            return Err(Error::AlreadyConnected);
        }

        let storage = self.inner.storage.lock().clone();
        if let Some(storage) = storage {
            let stored = storage.load_queued_messages().await?;
            self.inner.log.info(format_args!(
                "Loaded {} stored publications",
                stored.len()
            ));

            for message in stored.into_iter().rev() {
                let sequence = self.inner.sequence();
                self.inner.pending.lock().push_front((sequence, message));
            }
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run().await });
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stop the connection task and disconnect gracefully. Queued publications are kept.
    pub async fn stop(&self) -> Result<(), Error> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        self.inner.persist().await;

        match self.inner.client.disconnect().await {
            Ok(()) | Err(Error::NotConnected) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Queue a message for publication.
    ///
    /// # Returns
    /// An error if the topic is invalid, or [ReasonCode::QuotaExceeded] if the queue is full and
    /// new messages are dropped.
    pub async fn publish(&self, message: ApplicationMessage) -> Result<(), Error> {
        topic::validate_topic_name(&message.topic)?;

        {
            let sequence = self.inner.sequence();
            let mut pending = self.inner.pending.lock();
            if pending.len() >= self.inner.max_pending {
                match self.inner.overflow {
                    OverflowStrategy::DropNewMessage => {
                        self.inner.log.warn(format_args!(
                            "Queue full, dropping publication to `{}`",
                            message.topic
                        ));
                        return Err(Error::Failed(ReasonCode::QuotaExceeded));
                    }
                    OverflowStrategy::DropOldestQueuedMessage => {
                        if let Some((_, dropped)) = pending.pop_front() {
                            self.inner.log.warn(format_args!(
                                "Queue full, dropping oldest publication to `{}`",
                                dropped.topic
                            ));
                        }
                    }
                }
            }

            pending.push_back((sequence, message));
        }

        self.inner.persist().await;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Subscribe now if connected, and again after every connection that did not resume the
    /// session.
    pub fn subscribe(&self, subscriptions: &[TopicSubscription]) -> Result<(), Error> {
        for subscription in subscriptions.iter() {
            topic::validate_filter(&subscription.filter)?;
        }

        let mut remembered = self.inner.subscriptions.lock();
        let mut changes = self.inner.changes.lock();
        for subscription in subscriptions.iter() {
            remembered.insert(subscription.filter.clone(), subscription.clone());
            changes
                .unsubscribe
                .retain(|filter| filter != &subscription.filter);
            changes
                .subscribe
                .retain(|pending| pending.filter != subscription.filter);
            changes.subscribe.push(subscription.clone());
        }

        drop(changes);
        drop(remembered);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Forget subscriptions.
    pub fn unsubscribe(&self, filters: &[&str]) {
        let mut remembered = self.inner.subscriptions.lock();
        let mut changes = self.inner.changes.lock();
        for filter in filters.iter() {
            remembered.remove(*filter);
            changes.subscribe.retain(|pending| pending.filter != *filter);
            if !changes.unsubscribe.iter().any(|pending| pending == filter) {
                changes.unsubscribe.push(filter.to_string());
            }
        }

        drop(changes);
        drop(remembered);
        self.inner.wake.notify_one();
    }
}

impl Drop for ManagedClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl ManagedInner {
    fn sequence(&self) -> u64 {
        let mut next = self.next_sequence.lock();
        *next += 1;
        *next
    }

    async fn persist(&self) {
        let storage = self.storage.lock().clone();
        let Some(storage) = storage else {
            return;
        };

        let messages: Vec<ApplicationMessage> = self
            .pending
            .lock()
            .iter()
            .map(|(_, message)| message.clone())
            .collect();

        if let Err(error) = storage.save_queued_messages(messages).await {
            self.log
                .error(format_args!("Saving queued publications failed: {}", error));
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if !self.client.is_connected() {
                match self.client.connect().await {
                    Ok(ack) => {
                        self.log.info(format_args!(
                            "Connected, session present: {}",
                            ack.session_present
                        ));
                        if !ack.session_present {
                            self.restore_subscriptions();
                        }
                    }
                    Err(Error::AlreadyConnected) => {}
                    Err(error) => {
                        self.log.warn(format_args!(
                            "Connecting failed: {}, retrying in {:?}",
                            error, self.reconnect_delay
                        ));
                        tokio::time::sleep(self.reconnect_delay).await;
                        continue;
                    }
                }
            }

            if let Err(error) = self.synchronize_subscriptions().await {
                self.log
                    .warn(format_args!("Updating subscriptions failed: {}", error));
            }

            self.publish_pending().await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.connection_check_interval) => {}
            }
        }
    }

    /// Schedule every remembered subscription for a broker that holds no session.
    fn restore_subscriptions(&self) {
        let remembered = self.subscriptions.lock();
        let mut changes = self.changes.lock();
        changes.unsubscribe.clear();
        changes.subscribe = remembered.values().cloned().collect();
    }

    async fn synchronize_subscriptions(&self) -> Result<(), Error> {
        let changes = std::mem::take(&mut *self.changes.lock());

        if !changes.subscribe.is_empty() {
            match self.client.subscribe(&changes.subscribe, &[]).await {
                Ok(codes) => {
                    for (subscription, code) in changes.subscribe.iter().zip(codes) {
                        if code.failed() {
                            self.log.warn(format_args!(
                                "Subscription to `{}` refused: {:?}",
                                subscription.filter, code
                            ));
                        }
                    }
                }
                Err(error) => {
                    self.requeue(changes);
                    return Err(error);
                }
            }
        }

        if !changes.unsubscribe.is_empty() {
            let filters: Vec<&str> = changes.unsubscribe.iter().map(String::as_str).collect();
            if let Err(error) = self.client.unsubscribe(&filters, &[]).await {
                self.requeue(SubscriptionChanges {
                    subscribe: Vec::new(),
                    unsubscribe: changes.unsubscribe,
                });
                return Err(error);
            }
        }

        Ok(())
    }

    /// Return changes that could not be sent, unless newer changes superseded them.
    fn requeue(&self, failed: SubscriptionChanges) {
        let mut changes = self.changes.lock();
        for subscription in failed.subscribe {
            let superseded = changes
                .subscribe
                .iter()
                .any(|pending| pending.filter == subscription.filter)
                || changes.unsubscribe.contains(&subscription.filter);
            if !superseded {
                changes.subscribe.push(subscription);
            }
        }

        for filter in failed.unsubscribe {
            let superseded = changes.unsubscribe.contains(&filter)
                || changes
                    .subscribe
                    .iter()
                    .any(|pending| pending.filter == filter);
            if !superseded {
                changes.unsubscribe.push(filter);
            }
        }
    }

    /// Hand queued publications to the connection in order.
    ///
    /// A publication stays queued only if the connection was down. Any other outcome removes it:
    /// a timed out QoS 1 or QoS 2 publication stays in flight in the client and is retransmitted
    /// from there.
    async fn publish_pending(&self) {
        loop {
            let next = self.pending.lock().front().cloned();
            let Some((sequence, message)) = next else {
                break;
            };

            let topic = message.topic.clone();
            match self.client.publish(message).await {
                Ok(()) => {}
                Err(Error::NotConnected) => break,
                Err(error) => self.log.warn(format_args!(
                    "Publication to `{}` failed: {}",
                    topic, error
                )),
            }

            self.pending
                .lock()
                .retain(|(queued, _)| *queued != sequence);
            self.persist().await;
        }
    }
}
