//! The MQTT broker.
//!
//! # Design
//! The broker owns the [SessionStore] and everything shared between connections. Each accepted
//! transport is served by its own task pair (see the `connection` module). Connections interact
//! only through the store, so a failing connection never affects another one.
//!
//! Retained messages are written to [Storage] after every change. Saves run on their own task
//! and are serialized, and each save writes the table as it is when the save starts, so the
//! last save always holds the latest table.
use crate::{
    config::BrokerOptions,
    connection,
    events::{BrokerEvent, EventHandlers},
    interceptors::{AcceptAll, BrokerInterceptor},
    logging::Logger,
    properties::Property,
    publication::ApplicationMessage,
    retained::RetainedChange,
    session::SessionStatus,
    sessions::{PublishOutcome, SessionStore},
    storage::Storage,
    topic,
    transport::{TcpTransport, Transport},
    Error, Will,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub(crate) struct BrokerShared {
    pub options: BrokerOptions,
    pub store: SessionStore,
    pub events: EventHandlers<BrokerEvent>,
    interceptor: RwLock<Arc<dyn BrokerInterceptor>>,
    storage: RwLock<Option<Arc<dyn Storage>>>,
    save_gate: tokio::sync::Mutex<()>,
    next_connection_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    pub log: Logger,
}

impl BrokerShared {
    pub fn interceptor(&self) -> Arc<dyn BrokerInterceptor> {
        self.interceptor.read().clone()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A receiver that changes once the broker stops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Route a message to the sessions subscribed to its topic and raise the resulting events.
    ///
    /// # Args
    /// * `sender` - The client identifier of the publisher, or `None` for the broker itself.
    pub fn route(self: &Arc<Self>, sender: Option<&str>, message: ApplicationMessage) -> PublishOutcome {
        let outcome = self.store.publish(sender, &message);

        if let Some(change) = outcome.retained {
            if change != RetainedChange::Unchanged {
                self.events.emit(&BrokerEvent::RetainedMessageChanged {
                    topic: message.topic.clone(),
                    change,
                });
                self.save_retained();
            }
        }

        for dropped in outcome.dropped.iter() {
            self.log.warn(format_args!(
                "Queue of `{}` full, dropped message on `{}`",
                dropped.client_id, dropped.message.topic
            ));
            self.events.emit(&BrokerEvent::MessageDropped {
                client_id: dropped.client_id.clone(),
                message: dropped.message.clone(),
            });
        }

        if outcome.matched_sessions == 0 {
            self.events.emit(&BrokerEvent::ApplicationMessageNotConsumed {
                sender: sender.map(str::to_string),
                message,
            });
        }

        outcome
    }

    fn save_retained(self: &Arc<Self>) {
        let Some(storage) = self.storage.read().clone() else {
            return;
        };

        let shared = self.clone();
        tokio::spawn(async move {
            let _gate = shared.save_gate.lock().await;
            let messages = shared.store.retained_messages();
            if let Err(error) = storage.save_retained_messages(messages).await {
                shared
                    .log
                    .error(format_args!("Saving retained messages failed: {}", error));
            }
        });
    }

    /// Publish the will of a client, either now or once the delay elapsed without the client
    /// reconnecting.
    pub fn publish_will(self: &Arc<Self>, client_id: &str, will: Will, delay: Duration, epoch: u64) {
        let message = ApplicationMessage {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
            properties: will
                .properties
                .into_iter()
                .filter(|prop| !matches!(prop, Property::WillDelayInterval(_)))
                .collect(),
        };

        if delay.is_zero() {
            self.log
                .info(format_args!("Publishing will of `{}`", client_id));
            self.route(Some(client_id), message);
            return;
        }

        self.log.debug(format_args!(
            "Will of `{}` scheduled in {:?}",
            client_id, delay
        ));
        let shared = self.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.store.will_due(&client_id, epoch) {
                shared
                    .log
                    .info(format_args!("Publishing delayed will of `{}`", client_id));
                shared.route(Some(&client_id), message);
            }
        });
    }
}

/// An MQTT broker.
///
/// Connections are accepted with [MqttBroker::serve] or handed over individually with
/// [MqttBroker::accept].
pub struct MqttBroker {
    shared: Arc<BrokerShared>,
    purge: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    pub fn new(options: BrokerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = BrokerShared {
            store: SessionStore::new(&options),
            events: EventHandlers::new(),
            interceptor: RwLock::new(Arc::new(AcceptAll)),
            storage: RwLock::new(None),
            save_gate: tokio::sync::Mutex::new(()),
            next_connection_id: AtomicU64::new(1),
            shutdown,
            log: options.logger.clone(),
            options,
        };

        Self {
            shared: Arc::new(shared),
            purge: Mutex::new(None),
        }
    }

    pub fn with_interceptor(self, interceptor: impl BrokerInterceptor + 'static) -> Self {
        *self.shared.interceptor.write() = Arc::new(interceptor);
        self
    }

    /// Keep retained messages in `storage`. They are loaded by [MqttBroker::start].
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        *self.shared.storage.write() = Some(storage);
        self
    }

    pub fn events(&self) -> &EventHandlers<BrokerEvent> {
        &self.shared.events
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.shared.options
    }

    /// Direct access to sessions and retained messages.
    pub fn sessions(&self) -> &SessionStore {
        &self.shared.store
    }

    /// Load retained messages from storage and start removing expired sessions.
    pub async fn start(&self) -> Result<(), Error> {
        let storage = self.shared.storage.read().clone();
        if let Some(storage) = storage {
            let messages = storage.load_retained_messages().await?;
            self.shared.log.info(format_args!(
                "Loaded {} retained messages",
                messages.len()
            ));
            self.shared.store.retained().load(messages);
        }

        let mut purge = self.purge.lock();
        if purge.is_none() {
            let shared = self.shared.clone();
            let period = self.shared.options.session_purge_interval;
            *purge = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    shared.store.purge_expired();
                }
            }));
        }

        Ok(())
    }

    /// Serve a single connection on its own task.
    pub fn accept(&self, transport: impl Transport + 'static) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        tokio::spawn(async move { connection::serve(shared, transport).await })
    }

    /// Accept TCP connections until the broker stops.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut shutdown = self.shared.shutdown_signal();
        if let Ok(address) = listener.local_addr() {
            self.shared
                .log
                .info(format_args!("Listening on {}", address));
        }

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, address) = accepted?;
                    self.shared
                        .log
                        .debug(format_args!("Accepted connection from {}", address));
                    if let Err(error) = stream.set_nodelay(true) {
                        self.shared
                            .log
                            .warn(format_args!("Cannot disable Nagle for {}: {}", address, error));
                    }
                    self.accept(TcpTransport::from_stream(stream));
                }
                _ = shutdown.changed() => {}
            }
        }

        Ok(())
    }

    /// Publish a message on behalf of the broker.
    pub fn publish(&self, message: ApplicationMessage) -> Result<PublishOutcome, Error> {
        topic::validate_topic_name(&message.topic)?;
        Ok(self.shared.route(None, message))
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.shared.store.client_ids()
    }

    pub fn session_status(&self) -> Vec<SessionStatus> {
        self.shared.store.session_status()
    }

    /// Remove a session, disconnecting its client with
    /// [ReasonCode::AdministrativeAction](crate::ReasonCode::AdministrativeAction).
    pub fn delete_session(&self, client_id: &str) -> bool {
        self.shared.store.delete_session(client_id)
    }

    pub fn retained_messages(&self) -> Vec<ApplicationMessage> {
        self.shared.store.retained_messages()
    }

    pub fn clear_retained_messages(&self) {
        self.shared.store.clear_retained_messages();
        self.shared.save_retained();
    }

    /// Disconnect every client with
    /// [ReasonCode::ServerShuttingDown](crate::ReasonCode::ServerShuttingDown) and stop
    /// accepting connections.
    pub fn stop(&self) {
        self.shared.log.info(format_args!("Stopping"));
        self.shared.shutdown.send_replace(true);
        if let Some(purge) = self.purge.lock().take() {
            purge.abort();
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(purge) = self.purge.lock().take() {
            purge.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::MemoryStorage, types::SubscriptionOptions, types::TopicSubscription, QoS};

    fn broker() -> MqttBroker {
        MqttBroker::new(BrokerOptions::default())
    }

    fn events(broker: &MqttBroker) -> Arc<Mutex<Vec<BrokerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        broker.events().add(move |event| sink.lock().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn unconsumed_publication() {
        let broker = broker();
        let events = events(&broker);

        let outcome = broker
            .publish(ApplicationMessage::new("nobody/listens", "data"))
            .unwrap();
        assert_eq!(outcome.matched_sessions, 0);
        assert!(matches!(
            events.lock().as_slice(),
            [BrokerEvent::ApplicationMessageNotConsumed { sender: None, .. }]
        ));

        assert!(broker.publish(ApplicationMessage::new("a/#", "data")).is_err());
    }

    #[tokio::test]
    async fn retained_messages_saved_and_loaded() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = broker().with_storage(storage.clone());
        let events = events(&broker);
        broker.start().await.unwrap();

        let mut message = ApplicationMessage::new("state", "on");
        message.retain = true;
        broker.publish(message).unwrap();
        assert!(events.lock().iter().any(|event| matches!(
            event,
            BrokerEvent::RetainedMessageChanged {
                change: RetainedChange::Added,
                ..
            }
        )));

        // Saves run on their own task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.load_retained_messages().await.unwrap().len(), 1);
        broker.stop();

        let restarted = MqttBroker::new(BrokerOptions::default()).with_storage(storage.clone());
        restarted.start().await.unwrap();
        assert_eq!(restarted.retained_messages().len(), 1);

        restarted.clear_retained_messages();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(storage.load_retained_messages().await.unwrap().is_empty());
        restarted.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_will_waits_for_reconnect() {
        let broker = broker();
        let shared = broker.shared.clone();
        let store = &shared.store;

        // A persistent session without a connection stands in for the disconnected client.
        let (handle, _stop) = crate::session::ConnectionHandle::new(1);
        store.connect(crate::sessions::SessionRequest {
            client_id: "watcher".into(),
            clean_start: true,
            persistent: false,
            expiry_interval: 0,
            will: None,
            connection: handle,
        });
        store.subscribe(
            "watcher",
            &[TopicSubscription::new("wills/#", SubscriptionOptions::new(QoS::AtMostOnce))],
            None,
        );

        let will = Will::new("wills/sensor", "gone", &[Property::WillDelayInterval(5)]).unwrap();
        shared.publish_will("sensor", will, Duration::from_secs(5), 42);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.session("watcher").unwrap().lock().pending_messages(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let session = store.session("watcher").unwrap();
        let mut session = session.lock();
        assert_eq!(session.pending_messages(), 1);
        let message = session.next_message(tokio::time::Instant::now()).unwrap();
        assert_eq!(message.topic, "wills/sensor");
        assert!(message.properties.is_empty());
    }
}
