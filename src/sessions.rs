//! The broker's session and retained message store.
//!
//! Sessions are kept per client identifier, each behind its own lock, so that publications to
//! different sessions never contend. The topic index and the retained message table have their
//! own locks. Locks are always taken in the order session table, session, topic index, retained
//! table, and no lock is held across an await point.
use crate::{
    config::{BrokerOptions, OverflowStrategy},
    delivery::DeliveryEngine,
    logging::Logger,
    publication::ApplicationMessage,
    reason_codes::ReasonCode,
    retained::{RetainedChange, RetainedMessageStore},
    session::{ConnectionHandle, QueuedMessage, Session, SessionStatus, Subscription},
    topic::{SubscriptionIndex, TopicFilter},
    types::{RetainHandling, TopicSubscription},
    QoS, Will,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// A message that could not be queued for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedMessage {
    pub client_id: String,
    pub message: ApplicationMessage,
}

/// The result of [SessionStore::publish].
#[derive(Debug, Default, PartialEq)]
pub struct PublishOutcome {
    /// The number of sessions the message was queued for.
    pub matched_sessions: usize,

    /// Messages dropped by full session queues.
    pub dropped: Vec<DroppedMessage>,

    /// The change to the retained message table, for retained publications.
    pub retained: Option<RetainedChange>,
}

/// The result of [SessionStore::subscribe].
#[derive(Debug, Default, PartialEq)]
pub struct SubscribeOutcome {
    /// One code per requested filter.
    pub reason_codes: Vec<ReasonCode>,

    /// Retained messages dropped by a full session queue.
    pub dropped: Vec<DroppedMessage>,
}

pub(crate) struct SessionRequest {
    pub client_id: String,
    pub clean_start: bool,
    pub persistent: bool,
    pub expiry_interval: u32,
    pub will: Option<Will>,
    pub connection: ConnectionHandle,
}

pub(crate) struct AttachedSession {
    pub session: Arc<Mutex<Session>>,
    pub session_present: bool,
    pub engine: DeliveryEngine,

    /// The connection that held the session until now, and its will.
    pub taken_over: Option<(ConnectionHandle, Option<Will>)>,

    /// Resolves to the delivery state of the displaced connection once it terminated. Only set
    /// when a live session was resumed.
    pub inherited: Option<oneshot::Receiver<DeliveryEngine>>,
}

pub(crate) struct Termination {
    pub will: Option<Will>,
    pub will_delay: Duration,
    pub epoch: u64,
}

#[derive(Default)]
struct Target {
    qos: Option<QoS>,
    retain_as_published: bool,
    identifiers: Vec<u32>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    index: RwLock<SubscriptionIndex<String, Subscription>>,
    retained: RetainedMessageStore,
    next_epoch: AtomicU64,
    max_pending: usize,
    overflow: OverflowStrategy,
    maximum_qos: QoS,
    persistence_enabled: bool,
    retransmit_interval: Duration,
    log: Logger,
}

impl SessionStore {
    pub fn new(options: &BrokerOptions) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(SubscriptionIndex::new()),
            retained: RetainedMessageStore::new(),
            next_epoch: AtomicU64::new(1),
            max_pending: options.max_pending_messages_per_client,
            overflow: options.overflow_strategy,
            maximum_qos: options.maximum_qos,
            persistence_enabled: options.persistent_sessions,
            retransmit_interval: options.retransmit_interval,
            log: options.logger.with_source("sessions"),
        }
    }

    pub fn retained(&self) -> &RetainedMessageStore {
        &self.retained
    }

    fn unindex(&self, session: &Session) {
        let mut index = self.index.write();
        for subscription in session.subscriptions() {
            index.unsubscribe(&subscription.filter, &session.client_id().to_string());
        }
    }

    fn new_engine(&self, client_id: &str) -> DeliveryEngine {
        DeliveryEngine::new(self.retransmit_interval, self.log.with_source(client_id))
    }

    /// Attach a new connection to the session of its client identifier.
    pub(crate) fn connect(&self, request: SessionRequest) -> AttachedSession {
        let now = Instant::now();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write();
        let mut taken_over = None;

        if let Some(existing) = sessions.get(&request.client_id).cloned() {
            let mut session = existing.lock();
            if let Some(previous) = session.connection.take() {
                taken_over = Some((previous, session.will.take()));
            }

            if !request.clean_start && !session.is_expired(now) {
                self.log.debug(format_args!(
                    "Resuming session of `{}`",
                    request.client_id
                ));
                session.persistent = request.persistent;
                session.expiry_interval = request.expiry_interval;
                session.will = request.will;
                session.connection = Some(request.connection);
                session.disconnected_at = None;
                session.epoch = epoch;
                let engine = session
                    .engine
                    .take()
                    .unwrap_or_else(|| self.new_engine(&request.client_id));

                // The displaced connection still owns the in-flight exchanges.
                let inherited = taken_over.as_ref().map(|(previous, _)| {
                    let (handoff, inherited) = oneshot::channel();
                    session.handoff = Some((previous.id, handoff));
                    inherited
                });
                drop(session);

                return AttachedSession {
                    session: existing,
                    session_present: true,
                    engine,
                    taken_over,
                    inherited,
                };
            }

            self.log.debug(format_args!(
                "Discarding previous session of `{}`",
                request.client_id
            ));
            session.handoff = None;
            self.unindex(&session);
        }

        let mut session = Session::new(
            request.client_id.clone(),
            request.persistent,
            request.expiry_interval,
        );
        session.will = request.will;
        session.connection = Some(request.connection);
        session.epoch = epoch;

        let session = Arc::new(Mutex::new(session));
        sessions.insert(request.client_id.clone(), session.clone());

        AttachedSession {
            session,
            session_present: false,
            engine: self.new_engine(&request.client_id),
            taken_over,
            inherited: None,
        }
    }

    /// Detach a connection from its session.
    ///
    /// Persistent sessions keep their subscriptions, queue and delivery state. Other sessions
    /// are released. The will is returned for publication unless the disconnection was graceful.
    ///
    /// A connection displaced by a takeover hands its delivery state to the connection that
    /// resumed the session.
    ///
    /// # Returns
    /// `None` if the connection no longer owns the session, e.g. after a takeover.
    pub(crate) fn terminate(
        &self,
        client_id: &str,
        connection_id: u64,
        graceful: bool,
        mut engine: DeliveryEngine,
    ) -> Option<Termination> {
        let mut sessions = self.sessions.write();
        let existing = sessions.get(client_id)?.clone();
        let mut session = existing.lock();

        if session.connection.as_ref().map(|connection| connection.id) != Some(connection_id) {
            match session.handoff.take() {
                Some((from, handoff)) if from == connection_id => {
                    engine.disconnected();
                    if let Err(mut engine) = handoff.send(engine) {
                        engine.clear();
                    }
                }
                other => {
                    session.handoff = other;
                    engine.clear();
                }
            }
            return None;
        }

        session.connection = None;
        session.disconnected_at = Some(Instant::now());
        let epoch = session.epoch;
        let will = session.will.take().filter(|_| !graceful);
        let keep = self.persistence_enabled && session.persistent;

        let session_lifetime = if keep { session.expiry_interval } else { 0 };
        let will_delay = will
            .as_ref()
            .map(|will| will.delay_interval().min(session_lifetime))
            .unwrap_or_default();

        if keep {
            engine.disconnected();
            session.engine = Some(engine);
        } else {
            engine.clear();
            self.unindex(&session);
            drop(session);
            sessions.remove(client_id);
        }

        Some(Termination {
            will,
            will_delay: Duration::from_secs(will_delay as u64),
            epoch,
        })
    }

    /// True if the client has not reconnected since the termination that produced the epoch.
    pub(crate) fn will_due(&self, client_id: &str, epoch: u64) -> bool {
        match self.sessions.read().get(client_id) {
            Some(session) => {
                let session = session.lock();
                session.epoch == epoch && !session.is_connected()
            }
            None => true,
        }
    }

    /// Add or replace subscriptions of a session.
    ///
    /// Retained messages matching each new filter are queued for the session, subject to the
    /// retain handling option.
    ///
    /// # Returns
    /// `None` if there is no session for the client identifier.
    pub fn subscribe(
        &self,
        client_id: &str,
        subscriptions: &[TopicSubscription],
        identifier: Option<u32>,
    ) -> Option<SubscribeOutcome> {
        let session = self.sessions.read().get(client_id)?.clone();
        let mut session = session.lock();
        let mut outcome = SubscribeOutcome::default();

        for request in subscriptions {
            let Ok(filter) = TopicFilter::new(request.filter.clone()) else {
                outcome.reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            };

            let mut options = request.options;
            options.qos = options.qos.min(self.maximum_qos);

            let subscription = Subscription {
                filter: filter.clone(),
                options,
                identifier,
            };

            let existed = session
                .subscriptions
                .insert(request.filter.clone(), subscription.clone())
                .is_some();
            self.index
                .write()
                .subscribe(&filter, client_id.to_string(), subscription);

            let send_retained = match options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendAtSubscribeIfNew => !existed,
                RetainHandling::DoNotSend => false,
            };

            if send_retained {
                for mut message in self.retained.matching(filter.as_str()) {
                    message.qos = message.qos.min(options.qos);
                    message.retain = true;
                    let queued = QueuedMessage {
                        message,
                        subscription_identifiers: identifier.into_iter().collect(),
                        enqueued_at: Instant::now(),
                    };

                    if let Some(dropped) = session.enqueue(queued, self.max_pending, self.overflow)
                    {
                        outcome.dropped.push(DroppedMessage {
                            client_id: client_id.to_string(),
                            message: dropped.message,
                        });
                    }
                }
            }

            outcome.reason_codes.push(options.qos.into());
        }

        Some(outcome)
    }

    /// Remove subscriptions of a session.
    ///
    /// # Returns
    /// `None` if there is no session for the client identifier.
    pub fn unsubscribe(&self, client_id: &str, filters: &[String]) -> Option<Vec<ReasonCode>> {
        let session = self.sessions.read().get(client_id)?.clone();
        let mut session = session.lock();

        let codes = filters
            .iter()
            .map(|filter| match session.subscriptions.remove(filter) {
                Some(subscription) => {
                    self.index
                        .write()
                        .unsubscribe(&subscription.filter, &client_id.to_string());
                    ReasonCode::Success
                }
                None if TopicFilter::new(filter.clone()).is_err() => {
                    ReasonCode::TopicFilterInvalid
                }
                None => ReasonCode::NoSubscriptionExisted,
            })
            .collect();

        Some(codes)
    }

    /// Route a message to every session with a matching subscription.
    ///
    /// Retained messages update the retained table first. Each session receives the message
    /// once, at the highest QoS granted by its matching subscriptions.
    pub fn publish(&self, sender: Option<&str>, message: &ApplicationMessage) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        if message.retain {
            outcome.retained = Some(self.retained.update(message));
        }

        let matches = self.index.read().subscribers(&message.topic);

        let mut targets: BTreeMap<String, Target> = BTreeMap::new();
        for (client_id, subscription) in matches {
            if subscription.options.no_local && sender == Some(client_id.as_str()) {
                continue;
            }

            let target = targets.entry(client_id).or_default();
            let qos = subscription.options.qos.min(message.qos);
            target.qos = Some(target.qos.map_or(qos, |current| current.max(qos)));
            target.retain_as_published |= subscription.options.retain_as_published;
            if let Some(id) = subscription.identifier {
                target.identifiers.push(id);
            }
        }

        for (client_id, mut target) in targets {
            let Some(session) = self.sessions.read().get(&client_id).cloned() else {
                continue;
            };

            let mut delivery = message.clone();
            delivery.qos = target.qos.unwrap_or(QoS::AtMostOnce);
            delivery.retain = message.retain && target.retain_as_published;
            target.identifiers.sort_unstable();
            target.identifiers.dedup();

            let queued = QueuedMessage {
                message: delivery,
                subscription_identifiers: target.identifiers,
                enqueued_at: Instant::now(),
            };

            let dropped = session
                .lock()
                .enqueue(queued, self.max_pending, self.overflow);
            outcome.matched_sessions += 1;

            if let Some(dropped) = dropped {
                self.log.warn(format_args!(
                    "Queue of `{}` is full, dropped message to `{}`",
                    client_id, dropped.message.topic
                ));
                outcome.dropped.push(DroppedMessage {
                    client_id,
                    message: dropped.message,
                });
            }
        }

        outcome
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_status(&self) -> Vec<SessionStatus> {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut status: Vec<SessionStatus> = sessions
            .iter()
            .map(|session| SessionStatus::from(&*session.lock()))
            .collect();
        status.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        status
    }

    /// Remove a session. A connected client is disconnected.
    ///
    /// # Returns
    /// True if the session existed.
    pub fn delete_session(&self, client_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.remove(client_id) else {
            return false;
        };

        let mut session = session.lock();
        if let Some(connection) = session.connection.take() {
            connection.stop(ReasonCode::AdministrativeAction);
        }
        session.will = None;
        session.clear_queue();
        self.unindex(&session);
        true
    }

    /// Remove disconnected sessions whose expiry interval elapsed.
    ///
    /// # Returns
    /// The client identifiers of the removed sessions.
    pub fn purge_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.write();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.lock().is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired.iter() {
            if let Some(session) = sessions.remove(id) {
                self.unindex(&session.lock());
            }
        }

        if !expired.is_empty() {
            self.log
                .info(format_args!("Purged {} expired sessions", expired.len()));
        }

        expired
    }

    pub fn retained_messages(&self) -> Vec<ApplicationMessage> {
        self.retained.all()
    }

    pub fn clear_retained_messages(&self) {
        self.retained.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{properties::Property, types::SubscriptionOptions};

    fn store() -> SessionStore {
        SessionStore::new(&BrokerOptions::default())
    }

    fn request(client_id: &str, clean_start: bool, connection: u64) -> SessionRequest {
        SessionRequest {
            client_id: client_id.into(),
            clean_start,
            persistent: true,
            expiry_interval: u32::MAX,
            will: None,
            connection: ConnectionHandle::new(connection).0,
        }
    }

    fn subscribe(store: &SessionStore, client_id: &str, filter: &str, qos: QoS) -> Vec<ReasonCode> {
        store
            .subscribe(
                client_id,
                &[TopicSubscription::new(filter, SubscriptionOptions::new(qos))],
                None,
            )
            .unwrap()
            .reason_codes
    }

    fn next(store: &SessionStore, client_id: &str) -> Option<ApplicationMessage> {
        store
            .session(client_id)
            .unwrap()
            .lock()
            .next_message(Instant::now())
    }

    #[test]
    fn publish_reaches_matching_sessions() {
        let store = store();
        store.connect(request("a", true, 1));
        store.connect(request("b", true, 2));

        assert_eq!(subscribe(&store, "a", "x/+", QoS::AtLeastOnce), vec![ReasonCode::GrantedQos1]);
        assert_eq!(subscribe(&store, "b", "y/#", QoS::AtMostOnce), vec![ReasonCode::Success]);

        let mut message = ApplicationMessage::new("x/1", "data");
        message.qos = QoS::ExactlyOnce;
        let outcome = store.publish(None, &message);
        assert_eq!(outcome.matched_sessions, 1);

        let delivered = next(&store, "a").unwrap();
        assert_eq!(delivered.qos, QoS::AtLeastOnce);
        assert!(next(&store, "b").is_none());

        let outcome = store.publish(None, &ApplicationMessage::new("z", "data"));
        assert_eq!(outcome.matched_sessions, 0);
    }

    #[test]
    fn subscribe_replaces_filter() {
        let store = store();
        store.connect(request("a", true, 1));
        subscribe(&store, "a", "x", QoS::ExactlyOnce);
        subscribe(&store, "a", "x", QoS::AtMostOnce);

        let status = store.session_status();
        assert_eq!(status[0].subscriptions, vec!["x".to_string()]);

        let mut message = ApplicationMessage::new("x", "data");
        message.qos = QoS::ExactlyOnce;
        store.publish(None, &message);
        assert_eq!(next(&store, "a").unwrap().qos, QoS::AtMostOnce);
        assert!(next(&store, "a").is_none());
    }

    #[test]
    fn overlapping_subscriptions_deliver_once() {
        let store = store();
        store.connect(request("a", true, 1));
        store.subscribe(
            "a",
            &[TopicSubscription::new("x/#", SubscriptionOptions::new(QoS::AtMostOnce))],
            Some(1),
        );
        store.subscribe(
            "a",
            &[TopicSubscription::new("x/+", SubscriptionOptions::new(QoS::ExactlyOnce))],
            Some(2),
        );

        let mut message = ApplicationMessage::new("x/y", "data");
        message.qos = QoS::ExactlyOnce;
        store.publish(None, &message);

        let delivered = next(&store, "a").unwrap();
        assert_eq!(delivered.qos, QoS::ExactlyOnce);
        assert_eq!(
            delivered.properties,
            vec![
                Property::SubscriptionIdentifier(1),
                Property::SubscriptionIdentifier(2)
            ]
        );
        assert!(next(&store, "a").is_none());
    }

    #[test]
    fn no_local_and_retain_as_published() {
        let store = store();
        store.connect(request("a", true, 1));
        store.subscribe(
            "a",
            &[TopicSubscription::new(
                "x",
                SubscriptionOptions::new(QoS::AtMostOnce)
                    .no_local()
                    .retain_as_published(),
            )],
            None,
        );

        let mut message = ApplicationMessage::new("x", "data");
        message.retain = true;
        assert_eq!(store.publish(Some("a"), &message).matched_sessions, 0);
        assert_eq!(store.publish(Some("b"), &message).matched_sessions, 1);
        assert!(next(&store, "a").unwrap().retain);
    }

    #[test]
    fn retained_delivery_on_subscribe() {
        let store = store();
        store.connect(request("a", true, 1));

        let mut message = ApplicationMessage::new("t", "on");
        message.retain = true;
        let outcome = store.publish(None, &message);
        assert_eq!(outcome.retained, Some(RetainedChange::Added));

        subscribe(&store, "a", "t", QoS::AtLeastOnce);
        let delivered = next(&store, "a").unwrap();
        assert!(delivered.retain);
        assert_eq!(delivered.payload, "on");

        // An empty retained payload clears the topic.
        message.payload = bytes::Bytes::new();
        store.publish(None, &message);
        next(&store, "a");
        store.connect(request("b", true, 2));
        subscribe(&store, "b", "t", QoS::AtLeastOnce);
        assert!(next(&store, "b").is_none());
    }

    #[test]
    fn retain_handling_if_new() {
        let store = store();
        store.connect(request("a", true, 1));
        let mut message = ApplicationMessage::new("t", "on");
        message.retain = true;
        store.publish(None, &message);

        let request = [TopicSubscription::new(
            "t",
            SubscriptionOptions::new(QoS::AtMostOnce)
                .retain_handling(RetainHandling::SendAtSubscribeIfNew),
        )];
        store.subscribe("a", &request, None);
        store.subscribe("a", &request, None);
        assert!(next(&store, "a").is_some());
        assert!(next(&store, "a").is_none());
    }

    #[test]
    fn invalid_filters_and_unsubscribe() {
        let store = store();
        store.connect(request("a", true, 1));
        assert_eq!(
            subscribe(&store, "a", "a/#/b", QoS::AtMostOnce),
            vec![ReasonCode::TopicFilterInvalid]
        );

        subscribe(&store, "a", "x", QoS::AtMostOnce);
        assert_eq!(
            store.unsubscribe("a", &["x".into(), "y".into()]),
            Some(vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted])
        );
        assert_eq!(store.publish(None, &ApplicationMessage::new("x", "")).matched_sessions, 0);
        assert!(store.subscribe("unknown", &[], None).is_none());
    }

    #[test]
    fn overflow_is_reported() {
        let store = SessionStore::new(&BrokerOptions::default().max_pending_messages_per_client(1));
        store.connect(request("a", true, 1));
        subscribe(&store, "a", "x", QoS::AtMostOnce);

        store.publish(None, &ApplicationMessage::new("x", "1"));
        let outcome = store.publish(None, &ApplicationMessage::new("x", "2"));
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].client_id, "a");
        assert_eq!(outcome.dropped[0].message.payload, "1");
        assert_eq!(next(&store, "a").unwrap().payload, "2");
    }

    #[test]
    fn session_resumption() {
        let store = store();
        let first = store.connect(request("a", false, 1));
        assert!(!first.session_present);
        subscribe(&store, "a", "x", QoS::AtLeastOnce);

        let termination = store.terminate("a", 1, true, first.engine).unwrap();
        assert!(termination.will.is_none());

        store.publish(None, &ApplicationMessage::new("x", "offline"));

        let second = store.connect(request("a", false, 2));
        assert!(second.session_present);
        assert_eq!(next(&store, "a").unwrap().payload, "offline");

        // A clean start discards the session.
        store.terminate("a", 2, true, second.engine);
        let third = store.connect(request("a", true, 3));
        assert!(!third.session_present);
        assert_eq!(store.publish(None, &ApplicationMessage::new("x", "")).matched_sessions, 0);
    }

    #[test]
    fn non_persistent_sessions_are_released() {
        let store = store();
        let mut req = request("a", true, 1);
        req.persistent = false;
        req.will = Some(Will::new("status", "gone", &[]).unwrap());
        let attached = store.connect(req);
        subscribe(&store, "a", "x", QoS::AtMostOnce);

        let termination = store.terminate("a", 1, false, attached.engine).unwrap();
        assert_eq!(termination.will.unwrap().topic, "status");
        assert_eq!(termination.will_delay, Duration::ZERO);
        assert!(store.client_ids().is_empty());
        assert!(store.will_due("a", termination.epoch));
    }

    #[test]
    fn takeover() {
        let store = store();
        let mut req = request("a", false, 1);
        req.will = Some(Will::new("status", "gone", &[]).unwrap());
        let first = store.connect(req);

        let second = store.connect(request("a", false, 2));
        let (previous, will) = second.taken_over.unwrap();
        assert_eq!(previous.id, 1);
        assert!(will.is_some());

        let mut inherited = second.inherited.unwrap();
        let mut engine = first.engine;
        let mut publish = crate::packets::Publish::new("x", "pending");
        publish.qos = QoS::AtLeastOnce;
        assert!(engine.send(publish, None).is_some());

        // The displaced connection no longer owns the session but passes on its exchanges.
        assert!(store.terminate("a", 1, false, engine).is_none());
        assert!(store.session("a").unwrap().lock().is_connected());
        assert_eq!(inherited.try_recv().unwrap().in_flight(), 1);
    }

    #[test]
    fn clean_takeover_inherits_nothing() {
        let store = store();
        let first = store.connect(request("a", false, 1));

        let second = store.connect(request("a", true, 2));
        assert!(second.taken_over.is_some());
        assert!(second.inherited.is_none());
        assert!(store.terminate("a", 1, false, first.engine).is_none());
    }

    #[test]
    fn delayed_will_cancelled_by_reconnect() {
        let store = store();
        let mut req = request("a", false, 1);
        req.will = Some(
            Will::new("status", "gone", &[Property::WillDelayInterval(30)]).unwrap(),
        );
        let attached = store.connect(req);

        let termination = store.terminate("a", 1, false, attached.engine).unwrap();
        assert_eq!(termination.will_delay, Duration::from_secs(30));
        assert!(store.will_due("a", termination.epoch));

        store.connect(request("a", false, 2));
        assert!(!store.will_due("a", termination.epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_sessions_are_purged() {
        let store = store();
        let mut req = request("a", false, 1);
        req.expiry_interval = 10;
        let attached = store.connect(req);
        subscribe(&store, "a", "x", QoS::AtMostOnce);
        store.terminate("a", 1, true, attached.engine);

        assert!(store.purge_expired().is_empty());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.purge_expired(), vec!["a".to_string()]);
        assert_eq!(store.publish(None, &ApplicationMessage::new("x", "")).matched_sessions, 0);
    }

    #[test]
    fn delete_session_stops_connection() {
        let store = store();
        let (handle, mut stop) = ConnectionHandle::new(1);
        let mut req = request("a", false, 1);
        req.connection = handle;
        store.connect(req);

        assert!(store.delete_session("a"));
        assert!(!store.delete_session("a"));
        assert_eq!(stop.try_recv().unwrap(), ReasonCode::AdministrativeAction);
    }
}
