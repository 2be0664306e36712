//! The broker side of a single client connection.
//!
//! # Design
//! A connection is served by two tasks. The receive task decodes packets in wire order and
//! forwards them over a bounded channel. The engine task owns the [DeliveryEngine] of the session
//! and reacts to whichever comes first: a received packet, a message queued for the session, a
//! stop request from the session store, the keep-alive and retransmission tick, or the broker
//! shutting down. All writes happen on the engine task, after any lock was released.
use crate::{
    broker::BrokerShared,
    channel::PacketChannel,
    delivery::DeliveryEngine,
    design_parameters::{INBOUND_CHANNEL_DEPTH, TOPIC_ALIAS_MAXIMUM},
    events::BrokerEvent,
    interceptors::{
        AuthenticationContext, ConnectionValidationContext, PublishInterceptionContext,
        SubscriptionInterceptionContext, UnsubscriptionInterceptionContext,
    },
    logging::Logger,
    packets::{Auth, ConnAck, Connect, Disconnect, Packet, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe},
    properties::{PropertiesExt, Property},
    publication::ApplicationMessage,
    reason_codes::ReasonCode,
    session::{ConnectionHandle, Session},
    sessions::SessionRequest,
    transport::Transport,
    CommunicationError, Error, ProtocolError, ProtocolVersion, QoS,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// How the engine loop ended.
struct Exit {
    /// The client sent DISCONNECT without asking for its will to be published.
    graceful: bool,

    /// Reported to MQTT v5 clients in a DISCONNECT before the transport is closed.
    reason: Option<ReasonCode>,
}

impl Exit {
    fn stopped(reason: ReasonCode) -> Self {
        Self {
            graceful: false,
            reason: Some(reason),
        }
    }
}

type Step = Result<Option<Exit>, Error>;

/// Serve a newly accepted transport until the connection ends.
pub(crate) async fn serve(shared: Arc<BrokerShared>, transport: Arc<dyn Transport>) {
    let id = shared.next_connection_id();
    let log = shared.log.with_source(&format!("connection-{}", id));
    let channel = Arc::new(PacketChannel::new(
        transport,
        ProtocolVersion::V311,
        log.clone(),
    ));
    channel
        .set_maximum_incoming_packet_size(shared.options.maximum_packet_size)
        .await;

    let timeout = shared.options.communication_timeout;
    let connect = match tokio::time::timeout(timeout, channel.receive()).await {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(packet)) => {
            log.warn(format_args!(
                "Expected CONNECT, received {:?}",
                packet.message_type()
            ));
            channel.close().await;
            return;
        }
        Ok(Err(Error::Protocol(ProtocolError::UnsupportedProtocolVersion))) => {
            log.info(format_args!("Refusing unsupported protocol version"));
            let refusal = ConnAck::new(ReasonCode::UnsupportedProtocol, false);
            channel.send(&Packet::ConnAck(refusal)).await.ok();
            channel.close().await;
            return;
        }
        Ok(Err(error)) => {
            log.warn(format_args!("Receiving CONNECT failed: {}", error));
            channel.close().await;
            return;
        }
        Err(_) => {
            log.warn(format_args!("No CONNECT received within {:?}", timeout));
            channel.close().await;
            return;
        }
    };

    let Some((mut connection, stop)) =
        Connection::attach(shared, channel.clone(), id, connect, log).await
    else {
        channel.close().await;
        return;
    };

    let exit = match connection.open().await {
        Ok(()) => connection.run(stop).await,
        Err(error) => connection.failure(error),
    };
    connection.finish(exit).await;
}

struct Connection {
    shared: Arc<BrokerShared>,
    channel: Arc<PacketChannel>,
    id: u64,
    client_id: String,
    version: ProtocolVersion,
    keep_alive: Duration,
    session: Arc<Mutex<Session>>,
    session_present: bool,
    engine: DeliveryEngine,
    topic_aliases: HashMap<u16, String>,
    assigned_client_id: bool,
    log: Logger,
}

impl Connection {
    /// Validate a CONNECT and attach the client to its session.
    ///
    /// A refused connection is answered with a CONNACK carrying the reason.
    async fn attach(
        shared: Arc<BrokerShared>,
        channel: Arc<PacketChannel>,
        id: u64,
        connect: Connect,
        log: Logger,
    ) -> Option<(Self, mpsc::UnboundedReceiver<ReasonCode>)> {
        let version = connect.protocol_version;

        let mut client_id = connect.client_id.clone();
        let assigned_client_id = client_id.is_empty();
        let mut reason_code = ReasonCode::Success;
        if assigned_client_id {
            // MQTT 3.1 requires an identifier.
            if version == ProtocolVersion::V310 {
                reason_code = ReasonCode::ClientIdentifierInvalid;
            }
            client_id = uuid::Uuid::new_v4().to_string();
        }

        let properties = &connect.properties;
        let mut context = ConnectionValidationContext {
            client_id: client_id.clone(),
            username: connect.username.clone(),
            password: connect.password.clone(),
            protocol_version: version,
            clean_session: connect.clean_session,
            authentication_method: properties.authentication_method().map(str::to_string),
            authentication_data: properties.authentication_data().map(<[u8]>::to_vec),
            user_properties: properties
                .user_properties()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            reason_code,
        };

        if context.reason_code.success() {
            shared.interceptor().validate_connection(&mut context);
        }

        if context.reason_code.failed() {
            log.info(format_args!(
                "Refusing `{}`: {:?}",
                client_id, context.reason_code
            ));
            let refusal = ConnAck::new(context.reason_code, false);
            channel.send(&Packet::ConnAck(refusal)).await.ok();
            return None;
        }

        let (persistent, expiry_interval) = match version {
            ProtocolVersion::V500 => {
                let expiry = properties.session_expiry_interval().unwrap_or(0);
                (expiry > 0, expiry)
            }
            _ if connect.clean_session => (false, 0),
            _ => (true, u32::MAX),
        };

        let (handle, stop) = ConnectionHandle::new(id);
        let attached = shared.store.connect(SessionRequest {
            client_id: client_id.clone(),
            clean_start: connect.clean_session,
            persistent,
            expiry_interval,
            will: connect.will.clone(),
            connection: handle,
        });

        if let Some((previous, will)) = attached.taken_over {
            log.info(format_args!("Taking over session of `{}`", client_id));
            previous.stop(ReasonCode::SessionTakenOver);

            // A delayed will is superseded by the new connection.
            if let Some(will) = will.filter(|will| will.delay_interval() == 0) {
                shared.publish_will(&client_id, will, Duration::ZERO, 0);
            }
        }

        let mut engine = attached.engine;
        if let Some(inherited) = attached.inherited {
            let timeout = shared.options.communication_timeout;
            match tokio::time::timeout(timeout, inherited).await {
                Ok(Ok(previous)) => engine = previous,
                _ => log.warn(format_args!(
                    "Delivery state of the displaced connection of `{}` was not released",
                    client_id
                )),
            }
        }
        engine.set_receive_maximum(properties.receive_maximum().unwrap_or(0));
        engine.set_retransmit_interval(shared.options.retransmit_interval);
        channel.set_maximum_outgoing_packet_size(properties.maximum_packet_size());

        let connection = Self {
            log: log.with_source(&client_id),
            shared,
            channel,
            id,
            client_id,
            version,
            keep_alive: Duration::from_secs(connect.keep_alive as u64),
            session: attached.session,
            session_present: attached.session_present,
            engine,
            topic_aliases: HashMap::new(),
            assigned_client_id,
        };

        Some((connection, stop))
    }

    /// Acknowledge the connection and continue the session.
    async fn open(&mut self) -> Result<(), Error> {
        let options = &self.shared.options;
        let mut acknowledge = ConnAck::new(ReasonCode::Success, self.session_present);

        if self.version == ProtocolVersion::V500 {
            let properties = &mut acknowledge.properties;
            if self.assigned_client_id {
                properties.push(Property::AssignedClientIdentifier(self.client_id.clone()));
            }
            if options.maximum_qos < QoS::ExactlyOnce {
                properties.push(Property::MaximumQoS(options.maximum_qos as u8));
            }
            if !options.retain_available {
                properties.push(Property::RetainAvailable(0));
            }
            if let Some(size) = options.maximum_packet_size {
                properties.push(Property::MaximumPacketSize(size));
            }
            properties.push(Property::TopicAliasMaximum(TOPIC_ALIAS_MAXIMUM));
        }

        self.channel.send(&Packet::ConnAck(acknowledge)).await?;
        self.log.info(format_args!(
            "Connected with {:?}, session present: {}",
            self.version, self.session_present
        ));
        self.shared.events.emit(&BrokerEvent::ClientConnected {
            client_id: self.client_id.clone(),
            session_present: self.session_present,
        });

        let resumed = self.engine.resume(self.session_present);
        self.send_all(resumed).await?;
        self.deliver_queued().await
    }

    async fn run(&mut self, mut stop: mpsc::UnboundedReceiver<ReasonCode>) -> Exit {
        let (forward, mut inbound) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let channel = self.channel.clone();
        let receiver = tokio::spawn(async move {
            loop {
                let received = channel.receive().await;
                let failed = received.is_err();
                if forward.send(received).await.is_err() || failed {
                    break;
                }
            }
        });

        let notify = self.session.lock().notifier();
        let mut shutdown = self.shared.shutdown_signal();
        let mut ticker = tokio::time::interval(self.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            if *shutdown.borrow() {
                break Exit::stopped(ReasonCode::ServerShuttingDown);
            }

            let step: Step = tokio::select! {
                received = inbound.recv() => match received {
                    Some(Ok(packet)) => self.handle_packet(packet).await,
                    Some(Err(error)) => Err(error),
                    None => Err(CommunicationError::Closed.into()),
                },
                _ = notify.notified() => self.deliver_queued().await.map(|_| None),
                reason = stop.recv() => {
                    Ok(Some(Exit::stopped(reason.unwrap_or(ReasonCode::UnspecifiedError))))
                }
                _ = ticker.tick() => self.handle_timers().await,
                _ = shutdown.changed() => Ok(Some(Exit::stopped(ReasonCode::ServerShuttingDown))),
            };

            match step {
                Ok(None) => {}
                Ok(Some(exit)) => break exit,
                Err(error) => break self.failure(error),
            }
        };

        receiver.abort();
        exit
    }

    fn tick_period(&self) -> Duration {
        let mut period = self.shared.options.retransmit_interval;
        if !self.keep_alive.is_zero() {
            period = period.min(self.keep_alive);
        }

        (period / 2).max(Duration::from_millis(10))
    }

    /// Map a connection error to the DISCONNECT reason reported to the client.
    fn failure(&self, error: Error) -> Exit {
        let reason = match &error {
            Error::Protocol(ProtocolError::PacketTooLarge) => Some(ReasonCode::PacketTooLarge),
            Error::Protocol(ProtocolError::InvalidTopicName) => {
                Some(ReasonCode::TopicNameInvalid)
            }
            Error::Protocol(
                ProtocolError::UnexpectedPacket
                | ProtocolError::UnsupportedPacket
                | ProtocolError::BadIdentifier,
            ) => Some(ReasonCode::ProtocolError),
            Error::Protocol(_) => Some(ReasonCode::MalformedPacket),
            Error::Failed(code) => Some(*code),
            _ => None,
        };

        match &error {
            Error::Communication(CommunicationError::Closed) => self
                .log
                .info(format_args!("Connection closed by the client")),
            error => self.log.warn(format_args!("Connection failed: {}", error)),
        }

        Exit {
            graceful: false,
            reason,
        }
    }

    /// Close the connection and hand the session back to the store.
    async fn finish(self, exit: Exit) {
        if let Some(reason) = exit.reason.filter(|_| self.version == ProtocolVersion::V500) {
            let disconnect = Packet::Disconnect(Disconnect::new(reason));
            let timeout = self.shared.options.communication_timeout;
            tokio::time::timeout(timeout, self.channel.send(&disconnect))
                .await
                .ok();
        }
        self.channel.close().await;

        let Connection {
            shared,
            client_id,
            engine,
            id,
            log,
            ..
        } = self;

        match shared.store.terminate(&client_id, id, exit.graceful, engine) {
            Some(termination) => {
                if let Some(will) = termination.will {
                    shared.publish_will(&client_id, will, termination.will_delay, termination.epoch);
                }
            }
            None => log.debug(format_args!("Session is attached elsewhere")),
        }

        log.info(format_args!("Disconnected, graceful: {}", exit.graceful));
        shared.events.emit(&BrokerEvent::ClientDisconnected {
            client_id,
            graceful: exit.graceful,
        });
    }

    /// Transmit packets in order. Publications the client cannot accept because of their size
    /// are dropped.
    async fn send_all(&mut self, packets: Vec<Packet>) -> Result<(), Error> {
        let mut packets: VecDeque<Packet> = packets.into();
        while let Some(packet) = packets.pop_front() {
            match self.channel.send(&packet).await {
                Ok(()) => {}
                Err(Error::Protocol(ProtocolError::PacketTooLarge)) => {
                    let Packet::Publish(publish) = &packet else {
                        return Err(ProtocolError::PacketTooLarge.into());
                    };

                    self.log.warn(format_args!(
                        "Dropping publication to `{}` exceeding the maximum packet size",
                        publish.topic
                    ));
                    if let Some(id) = publish.packet_id {
                        packets.extend(self.engine.abandon(id, ReasonCode::PacketTooLarge));
                    }
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// Move queued messages of the session into flight while the client's receive maximum
    /// allows.
    async fn deliver_queued(&mut self) -> Result<(), Error> {
        while self.engine.has_capacity() {
            let next = self.session.lock().next_message(Instant::now());
            let Some(message) = next else {
                break;
            };

            if let Some(packet) = self.engine.send(message.to_publish(), None) {
                self.send_all(vec![packet]).await?;
            }
        }

        Ok(())
    }

    async fn handle_timers(&mut self) -> Step {
        let now = Instant::now();

        if !self.keep_alive.is_zero() {
            let tolerance = self.shared.options.keep_alive_tolerance;
            let tolerance = if tolerance.is_finite() && tolerance >= 1.0 {
                tolerance
            } else {
                1.0
            };

            let idle = now.saturating_duration_since(self.channel.last_read());
            if idle >= self.keep_alive.mul_f64(tolerance) {
                self.log
                    .warn(format_args!("Keep-alive expired after {:?}", idle));
                return Ok(Some(Exit::stopped(ReasonCode::KeepAliveTimeout)));
            }
        }

        let retransmissions = self.engine.retransmissions(now);
        self.send_all(retransmissions).await?;
        Ok(None)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Step {
        match packet {
            Packet::Publish(publish) => return self.handle_publish(publish).await,

            Packet::PubRel(rel) => {
                let inbound = self.engine.handle_pubrel(&rel);
                let close = match inbound.deliver {
                    Some(publish) => self.dispatch(publish).1,
                    None => false,
                };

                if let Some(reply) = inbound.reply {
                    self.channel.send(&reply).await?;
                }
                if close {
                    return Ok(Some(Exit::stopped(ReasonCode::UnspecifiedError)));
                }
            }

            Packet::PubAck(ack) => {
                let released = self.engine.handle_puback(&ack);
                self.send_all(released).await?;
                self.deliver_queued().await?;
            }

            Packet::PubRec(rec) => {
                let replies = self.engine.handle_pubrec(&rec);
                self.send_all(replies).await?;
                self.deliver_queued().await?;
            }

            Packet::PubComp(comp) => {
                let released = self.engine.handle_pubcomp(&comp);
                self.send_all(released).await?;
                self.deliver_queued().await?;
            }

            Packet::Subscribe(subscribe) => return self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => return self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.channel.send(&Packet::PingResp).await?,
            Packet::Disconnect(disconnect) => return self.handle_disconnect(disconnect).map(Some),
            Packet::Auth(auth) => self.handle_auth(auth).await?,

            other => {
                self.log.warn(format_args!(
                    "Unexpected {:?} from client",
                    other.message_type()
                ));
                return Err(ProtocolError::UnexpectedPacket.into());
            }
        }

        Ok(None)
    }

    /// Replace an aliased topic by the topic registered for the alias.
    fn resolve_topic_alias(&mut self, publish: &mut Publish) -> Result<(), Error> {
        let Some(alias) = publish.properties.topic_alias() else {
            return Ok(());
        };

        if alias == 0 || alias > TOPIC_ALIAS_MAXIMUM {
            return Err(Error::Failed(ReasonCode::TopicAliasInvalid));
        }

        if publish.topic.is_empty() {
            publish.topic = self
                .topic_aliases
                .get(&alias)
                .cloned()
                .ok_or(Error::Failed(ReasonCode::ProtocolError))?;
        } else {
            self.topic_aliases.insert(alias, publish.topic.clone());
        }

        Ok(())
    }

    async fn handle_publish(&mut self, mut publish: Publish) -> Step {
        let options = &self.shared.options;
        if publish.qos > options.maximum_qos {
            return Err(Error::Failed(ReasonCode::QosNotSupported));
        }
        if publish.retain && !options.retain_available {
            return Err(Error::Failed(ReasonCode::RetainNotSupported));
        }

        self.resolve_topic_alias(&mut publish)?;

        let mut inbound = self.engine.handle_publish(publish);
        if let Some(publish) = inbound.deliver.take() {
            let (reason, close) = self.dispatch(publish);
            if close {
                return Ok(Some(Exit::stopped(ReasonCode::UnspecifiedError)));
            }

            if let Some(Packet::PubAck(ack)) = inbound.reply.as_mut() {
                ack.reason_code = reason;
            }
        }

        if let Some(reply) = inbound.reply {
            self.channel.send(&reply).await?;
        }

        Ok(None)
    }

    /// Intercept and route a publication of the client.
    ///
    /// # Returns
    /// The reason code for the publisher and whether the connection must be closed.
    fn dispatch(&self, publish: Publish) -> (ReasonCode, bool) {
        let mut context = PublishInterceptionContext {
            client_id: self.client_id.clone(),
            message: ApplicationMessage::from(publish),
            process: true,
            close_connection: false,
            reason_code: ReasonCode::Success,
        };
        self.shared.interceptor().intercept_publish(&mut context);

        if context.close_connection {
            return (context.reason_code, true);
        }

        if !context.process {
            self.log.debug(format_args!(
                "Publication to `{}` discarded by interceptor",
                context.message.topic
            ));
            return (context.reason_code, false);
        }

        let outcome = self.shared.route(Some(&self.client_id), context.message);
        if context.reason_code.success() && outcome.matched_sessions == 0 {
            (ReasonCode::NoMatchingSubscribers, false)
        } else {
            (context.reason_code, false)
        }
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Step {
        let identifier = subscribe
            .properties
            .subscription_identifiers()
            .first()
            .copied();
        let interceptor = self.shared.interceptor();

        let mut reason_codes = vec![ReasonCode::UnspecifiedError; subscribe.subscriptions.len()];
        let mut accepted = Vec::new();
        let mut positions = Vec::new();
        let mut close = false;

        for (position, subscription) in subscribe.subscriptions.into_iter().enumerate() {
            let mut context = SubscriptionInterceptionContext {
                client_id: self.client_id.clone(),
                subscription,
                process: true,
                close_connection: false,
                reason_code: ReasonCode::Success,
            };
            interceptor.intercept_subscription(&mut context);
            close |= context.close_connection;

            if context.process {
                accepted.push(context.subscription);
                positions.push(position);
            } else if context.reason_code.failed() {
                reason_codes[position] = context.reason_code;
            }
        }

        let mut subscribed = Vec::new();
        if !accepted.is_empty() {
            if let Some(outcome) = self
                .shared
                .store
                .subscribe(&self.client_id, &accepted, identifier)
            {
                for ((position, code), subscription) in positions
                    .iter()
                    .zip(outcome.reason_codes)
                    .zip(accepted.iter())
                {
                    reason_codes[*position] = code;
                    if code.success() {
                        subscribed.push(subscription.filter.clone());
                    }
                }

                for dropped in outcome.dropped {
                    self.shared.events.emit(&BrokerEvent::MessageDropped {
                        client_id: dropped.client_id,
                        message: dropped.message,
                    });
                }
            }
        }

        self.channel
            .send(&Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                reason_codes,
                properties: Vec::new(),
            }))
            .await?;

        if !subscribed.is_empty() {
            self.log
                .debug(format_args!("Subscribed to {:?}", subscribed));
            self.shared.events.emit(&BrokerEvent::SubscriptionChanged {
                client_id: self.client_id.clone(),
                subscribed,
                unsubscribed: Vec::new(),
            });
        }

        if close {
            return Ok(Some(Exit::stopped(ReasonCode::UnspecifiedError)));
        }

        // Retained messages were queued by the subscription.
        self.deliver_queued().await?;
        Ok(None)
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Step {
        let interceptor = self.shared.interceptor();
        let mut reason_codes = vec![ReasonCode::UnspecifiedError; unsubscribe.filters.len()];
        let mut accepted = Vec::new();
        let mut positions = Vec::new();
        let mut close = false;

        for (position, filter) in unsubscribe.filters.into_iter().enumerate() {
            let mut context = UnsubscriptionInterceptionContext {
                client_id: self.client_id.clone(),
                filter,
                process: true,
                close_connection: false,
                reason_code: ReasonCode::Success,
            };
            interceptor.intercept_unsubscription(&mut context);
            close |= context.close_connection;

            if context.process {
                accepted.push(context.filter);
                positions.push(position);
            } else if context.reason_code.failed() {
                reason_codes[position] = context.reason_code;
            }
        }

        let mut unsubscribed = Vec::new();
        if !accepted.is_empty() {
            let codes = self
                .shared
                .store
                .unsubscribe(&self.client_id, &accepted)
                .unwrap_or_default();
            for ((position, code), filter) in positions.iter().zip(codes).zip(accepted) {
                reason_codes[*position] = code;
                if code == ReasonCode::Success {
                    unsubscribed.push(filter);
                }
            }
        }

        self.channel
            .send(&Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
                reason_codes,
                properties: Vec::new(),
            }))
            .await?;

        if !unsubscribed.is_empty() {
            self.shared.events.emit(&BrokerEvent::SubscriptionChanged {
                client_id: self.client_id.clone(),
                subscribed: Vec::new(),
                unsubscribed,
            });
        }

        if close {
            return Ok(Some(Exit::stopped(ReasonCode::UnspecifiedError)));
        }

        Ok(None)
    }

    fn handle_disconnect(&mut self, disconnect: Disconnect) -> Result<Exit, Error> {
        if let Some(expiry) = disconnect.properties.session_expiry_interval() {
            let mut session = self.session.lock();

            // A session that ends with the connection cannot be made to outlive it.
            if session.expiry_interval == 0 && expiry > 0 {
                return Err(Error::Failed(ReasonCode::ProtocolError));
            }

            session.expiry_interval = expiry;
            session.persistent = expiry > 0;
        }

        self.log.debug(format_args!(
            "DISCONNECT received: {:?}",
            disconnect.reason_code
        ));

        Ok(Exit {
            graceful: disconnect.reason_code != ReasonCode::DisconnectWithWill,
            reason: None,
        })
    }

    async fn handle_auth(&mut self, auth: Auth) -> Result<(), Error> {
        let mut context = AuthenticationContext {
            client_id: self.client_id.clone(),
            method: auth.properties.authentication_method().map(str::to_string),
            data: auth.properties.authentication_data().map(<[u8]>::to_vec),
            response_data: None,
            reason_code: ReasonCode::Success,
        };
        self.shared.interceptor().authenticate(&mut context);

        if context.reason_code.failed() {
            return Err(Error::Failed(context.reason_code));
        }

        let mut properties = Vec::new();
        if let Some(method) = context.method {
            properties.push(Property::AuthenticationMethod(method));
        }
        if let Some(data) = context.response_data {
            properties.push(Property::AuthenticationData(data));
        }

        self.channel
            .send(&Packet::Auth(Auth {
                reason_code: context.reason_code,
                properties,
            }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec,
        config::BrokerOptions,
        interceptors::BrokerInterceptor,
        packets::PubResponse,
        transport::StreamTransport,
        types::{SubscriptionOptions, TopicSubscription},
        MqttBroker,
    };

    /// A raw MQTT peer for driving the broker packet by packet.
    struct Peer {
        channel: PacketChannel,
    }

    impl Peer {
        fn new(broker: &MqttBroker, version: ProtocolVersion) -> Self {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            broker.accept(StreamTransport::new(remote));
            Self {
                channel: PacketChannel::new(
                    Arc::new(StreamTransport::new(local)),
                    version,
                    Logger::default(),
                ),
            }
        }

        async fn send(&self, packet: Packet) {
            self.channel.send(&packet).await.unwrap();
        }

        async fn receive(&self) -> Packet {
            tokio::time::timeout(Duration::from_secs(5), self.channel.receive())
                .await
                .unwrap()
                .unwrap()
        }

        async fn connect(&self, connect: Connect) -> ConnAck {
            self.send(Packet::Connect(connect)).await;
            match self.receive().await {
                Packet::ConnAck(ack) => ack,
                other => panic!("Unexpected {:?}", other),
            }
        }
    }

    fn connect(client_id: &str) -> Connect {
        Connect::new(client_id, ProtocolVersion::V500)
    }

    #[tokio::test]
    async fn assigns_client_identifier() {
        let broker = MqttBroker::new(BrokerOptions::default());
        let peer = Peer::new(&broker, ProtocolVersion::V500);

        let ack = peer.connect(connect("")).await;
        assert_eq!(ack.reason_code, ReasonCode::Success);
        let assigned = ack.properties.assigned_client_identifier().unwrap();
        assert_eq!(assigned.len(), 36);
        assert_eq!(broker.client_ids(), vec![assigned.to_string()]);
    }

    #[tokio::test]
    async fn first_packet_must_be_connect() {
        let broker = MqttBroker::new(BrokerOptions::default());
        let peer = Peer::new(&broker, ProtocolVersion::V311);

        peer.send(Packet::PingReq).await;
        assert!(matches!(
            peer.channel.receive().await,
            Err(Error::Communication(CommunicationError::Closed))
        ));
    }

    #[tokio::test]
    async fn unsupported_protocol_level() {
        let broker = MqttBroker::new(BrokerOptions::default());
        let peer = Peer::new(&broker, ProtocolVersion::V311);

        // CONNECT with protocol level 6.
        let mut data = codec::encode(&Packet::Connect(connect("a")), ProtocolVersion::V500).unwrap();
        data[8] = 6;
        peer.channel.transport().write(&data).await.unwrap();

        match peer.receive().await {
            Packet::ConnAck(ack) => assert_eq!(ack.reason_code, ReasonCode::UnsupportedProtocol),
            other => panic!("Unexpected {:?}", other),
        }
    }

    struct RefuseGuests;

    impl BrokerInterceptor for RefuseGuests {
        fn validate_connection(&self, context: &mut ConnectionValidationContext) {
            if context.username.as_deref() == Some("guest") {
                context.reason_code = ReasonCode::NotAuthorized;
            }
        }

        fn intercept_publish(&self, context: &mut PublishInterceptionContext) {
            if context.message.topic.starts_with("forbidden/") {
                context.process = false;
                context.reason_code = ReasonCode::NotAuthorized;
            }
        }
    }

    #[tokio::test]
    async fn interceptor_decisions() {
        let broker = MqttBroker::new(BrokerOptions::default()).with_interceptor(RefuseGuests);

        let guest = Peer::new(&broker, ProtocolVersion::V500);
        let mut request = connect("guest");
        request.username = Some("guest".into());
        assert_eq!(guest.connect(request).await.reason_code, ReasonCode::NotAuthorized);
        assert!(broker.client_ids().is_empty());

        let peer = Peer::new(&broker, ProtocolVersion::V500);
        peer.connect(connect("member")).await;

        let mut publish = Publish::new("forbidden/x", "data");
        publish.qos = QoS::AtLeastOnce;
        publish.packet_id = Some(1);
        peer.send(Packet::Publish(publish)).await;
        assert_eq!(
            peer.receive().await,
            Packet::PubAck(PubResponse::with_reason(1, ReasonCode::NotAuthorized))
        );

        let mut publish = Publish::new("allowed/x", "data");
        publish.qos = QoS::AtLeastOnce;
        publish.packet_id = Some(2);
        peer.send(Packet::Publish(publish)).await;
        assert_eq!(
            peer.receive().await,
            Packet::PubAck(PubResponse::with_reason(2, ReasonCode::NoMatchingSubscribers))
        );
    }

    #[tokio::test]
    async fn topic_aliases() {
        let broker = MqttBroker::new(BrokerOptions::default());
        let subscriber = Peer::new(&broker, ProtocolVersion::V500);
        subscriber.connect(connect("subscriber")).await;
        subscriber
            .send(Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![TopicSubscription::new(
                    "sensors/#",
                    SubscriptionOptions::new(QoS::AtMostOnce),
                )],
                properties: Vec::new(),
            }))
            .await;
        assert!(matches!(subscriber.receive().await, Packet::SubAck(_)));

        let publisher = Peer::new(&broker, ProtocolVersion::V500);
        let ack = publisher.connect(connect("publisher")).await;
        assert!(ack
            .properties
            .contains(&Property::TopicAliasMaximum(TOPIC_ALIAS_MAXIMUM)));

        let mut first = Publish::new("sensors/temperature", "20");
        first.properties = vec![Property::TopicAlias(3)];
        publisher.send(Packet::Publish(first)).await;

        let mut second = Publish::new("", "21");
        second.properties = vec![Property::TopicAlias(3)];
        publisher.send(Packet::Publish(second)).await;

        for payload in ["20", "21"] {
            match subscriber.receive().await {
                Packet::Publish(publish) => {
                    assert_eq!(publish.topic, "sensors/temperature");
                    assert_eq!(&publish.payload[..], payload.as_bytes());
                    assert!(publish.properties.topic_alias().is_none());
                }
                other => panic!("Unexpected {:?}", other),
            }
        }

        // An alias that was never registered.
        let mut unknown = Publish::new("", "22");
        unknown.properties = vec![Property::TopicAlias(4)];
        publisher.send(Packet::Publish(unknown)).await;
        assert_eq!(
            publisher.receive().await,
            Packet::Disconnect(Disconnect::new(ReasonCode::ProtocolError))
        );
    }

    #[tokio::test]
    async fn qos_limit_enforced() {
        let broker =
            MqttBroker::new(BrokerOptions::default().maximum_qos(QoS::AtLeastOnce));
        let peer = Peer::new(&broker, ProtocolVersion::V500);
        let ack = peer.connect(connect("limited")).await;
        assert!(ack.properties.contains(&Property::MaximumQoS(1)));

        let mut publish = Publish::new("a", "b");
        publish.qos = QoS::ExactlyOnce;
        publish.packet_id = Some(1);
        peer.send(Packet::Publish(publish)).await;
        assert_eq!(
            peer.receive().await,
            Packet::Disconnect(Disconnect::new(ReasonCode::QosNotSupported))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_timeout() {
        let broker = MqttBroker::new(BrokerOptions::default());
        let peer = Peer::new(&broker, ProtocolVersion::V500);

        let mut request = connect("sleepy");
        request.keep_alive = 2;
        peer.connect(request).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            peer.receive().await,
            Packet::Disconnect(Disconnect::new(ReasonCode::KeepAliveTimeout))
        );
    }

    fn resumable(client_id: &str) -> Connect {
        let mut request = connect(client_id);
        request.clean_session = false;
        request.properties = vec![Property::SessionExpiryInterval(300)];
        request
    }

    #[tokio::test]
    async fn takeover_keeps_unacknowledged_deliveries() {
        let broker = MqttBroker::new(BrokerOptions::default());

        let first = Peer::new(&broker, ProtocolVersion::V500);
        let mut request = resumable("sub");
        request.properties.push(Property::ReceiveMaximum(2));
        assert!(!first.connect(request).await.session_present);
        first
            .send(Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![TopicSubscription::new(
                    "x",
                    SubscriptionOptions::new(QoS::ExactlyOnce),
                )],
                properties: Vec::new(),
            }))
            .await;
        assert!(matches!(first.receive().await, Packet::SubAck(_)));

        for (payload, qos) in [
            ("one", QoS::AtLeastOnce),
            ("two", QoS::ExactlyOnce),
            ("three", QoS::AtLeastOnce),
        ] {
            let mut message = ApplicationMessage::new("x", payload);
            message.qos = qos;
            broker.publish(message).unwrap();
        }

        // The receive maximum of 2 holds back the third message.
        for id in [1, 2] {
            match first.receive().await {
                Packet::Publish(publish) => assert_eq!(publish.packet_id, Some(id)),
                other => panic!("Unexpected {:?}", other),
            }
        }
        first.send(Packet::PubRec(PubResponse::new(2))).await;
        assert_eq!(first.receive().await, Packet::PubRel(PubResponse::new(2)));

        let second = Peer::new(&broker, ProtocolVersion::V500);
        second.send(Packet::Connect(resumable("sub"))).await;
        assert_eq!(
            first.receive().await,
            Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver))
        );
        match second.receive().await {
            Packet::ConnAck(ack) => assert!(ack.session_present),
            other => panic!("Unexpected {:?}", other),
        }

        let mut redelivered = Vec::new();
        let mut released = Vec::new();
        for _ in 0..3 {
            match second.receive().await {
                Packet::Publish(publish) => redelivered.push(publish),
                Packet::PubRel(rel) => released.push(rel.packet_id),
                other => panic!("Unexpected {:?}", other),
            }
        }

        assert_eq!(released, vec![2]);
        redelivered.sort_by_key(|publish| publish.packet_id);
        assert_eq!(redelivered.len(), 2);
        assert_eq!(&redelivered[0].payload[..], b"one");
        assert_eq!(redelivered[0].packet_id, Some(1));
        assert!(redelivered[0].dup);
        assert_eq!(&redelivered[1].payload[..], b"three");
        assert!(!redelivered[1].dup);

        second.send(Packet::PubAck(PubResponse::new(1))).await;
        second.send(Packet::PubComp(PubResponse::new(2))).await;
        second
            .send(Packet::PubAck(PubResponse::new(redelivered[1].packet_id.unwrap())))
            .await;
        assert_eq!(broker.client_ids(), vec!["sub".to_string()]);
    }

}
