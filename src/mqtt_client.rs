//! The client connection engine.
//!
//! # Design
//! Each connection runs a receive task that decodes packets in wire order. Every packet is first
//! offered to the [PacketDispatcher] so that callers waiting on a response (CONNACK, SUBACK,
//! UNSUBACK, PINGRESP, AUTH) are completed. Other packets are handled by the task itself, which
//! is also where [ClientEvent]s are raised, so events never reorder relative to the packets that
//! caused them. A timer task sends keep-alive pings and retransmits unacknowledged publications.
use crate::{
    channel::PacketChannel,
    config::ClientOptions,
    delivery::{DeliveryEngine, Inbound},
    dispatcher::{PacketAwaiter, PacketDispatcher},
    events::{ClientEvent, EventHandlers},
    logging::Logger,
    message_types::MessageType,
    packets::{Auth, ConnAck, Disconnect, Packet, Subscribe, Unsubscribe},
    properties::{self, Property},
    publication::ApplicationMessage,
    reason_codes::ReasonCode,
    session_state::{PingAction, SessionState},
    transport::Transport,
    types::TopicSubscription,
    CommunicationError, Error, ProtocolError, ProtocolVersion,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

mod sm {
    use smlang::statemachine;

    statemachine! {
        transitions: {
            *Disconnected + Connect = ConnectTransport,
            ConnectTransport + TransportConnected = Establishing,
            ConnectTransport + Disconnect = Disconnected,
            Establishing + ReceivedConnAck = Active,
            Establishing + Disconnect = Disconnected,
            Active + Disconnect = Disconnected,
        }
    }

    pub struct Context;

    impl StateMachineContext for Context {}
}

use sm::{Context, Events, StateMachine, States};

/// The task that initiated a teardown. It is not aborted by the teardown itself.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Origin {
    User,
    Receiver,
    Timer,
}

#[derive(Default)]
struct Tasks {
    receiver: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

struct ClientInner {
    options: ClientOptions,
    channel: PacketChannel,
    dispatcher: PacketDispatcher,
    connection_state: Mutex<StateMachine<Context>>,
    session_state: Mutex<SessionState>,
    engine: Mutex<DeliveryEngine>,
    events: EventHandlers<ClientEvent>,
    tasks: Mutex<Tasks>,
    connect_gate: tokio::sync::Mutex<()>,
    disconnect_reason: Mutex<Option<ReasonCode>>,
    log: Logger,
}

/// A client for interacting with an MQTT Broker.
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl MqttClient {
    /// Construct a new client. No connection is made until [MqttClient::connect] is called.
    ///
    /// # Args
    /// * `transport` - The byte stream to the broker.
    /// * `options` - The client configuration.
    pub fn new(transport: impl Transport + 'static, options: ClientOptions) -> Self {
        Self::with_transport(Arc::new(transport), options)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let log = options.logger.clone();
        let inner = ClientInner {
            channel: PacketChannel::new(transport, options.protocol_version, log.clone()),
            dispatcher: PacketDispatcher::new(),
            connection_state: Mutex::new(StateMachine::new(Context)),
            session_state: Mutex::new(SessionState::new(
                options.client_id.clone(),
                options.keep_alive,
            )),
            engine: Mutex::new(DeliveryEngine::new(
                options.retransmit_interval,
                log.with_source("delivery"),
            )),
            events: EventHandlers::new(),
            tasks: Mutex::new(Tasks::default()),
            connect_gate: tokio::sync::Mutex::new(()),
            disconnect_reason: Mutex::new(None),
            log,
            options,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Handlers for connection and message events.
    pub fn events(&self) -> &EventHandlers<ClientEvent> {
        &self.inner.events
    }

    /// The client identifier, as assigned by the broker if the configured one was empty.
    pub fn client_id(&self) -> String {
        self.inner.session_state.lock().client_id.clone()
    }

    /// Determine if the client has established a connection with the broker.
    pub fn is_connected(&self) -> bool {
        self.inner.is_active()
    }

    /// The number of publications that are in flight or held back by flow control.
    pub fn pending_messages(&self) -> usize {
        let engine = self.inner.engine.lock();
        engine.in_flight() + engine.queued()
    }

    /// Connect to the broker.
    ///
    /// In-flight publications of a resumed session are retransmitted once the broker accepted
    /// the connection.
    ///
    /// # Returns
    /// The CONNACK of the broker. A refused connection fails with [Error::Failed] carrying the
    /// reason code of the broker.
    pub async fn connect(&self) -> Result<ConnAck, Error> {
        let _gate = self.inner.connect_gate.lock().await;

        {
            let mut state = self.inner.connection_state.lock();
            if state.process_event(Events::Connect).is_err() {
                return Err(Error::AlreadyConnected);
            }
        }

        let result = self.inner.establish().await;
        if let Err(error) = &result {
            self.inner
                .log
                .warn(format_args!("Connection attempt failed: {}", error));
            self.inner.shutdown(Origin::User).await;
        }

        result
    }

    /// Disconnect gracefully. The broker discards the will message.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.disconnect_with(ReasonCode::Success, &[]).await
    }

    /// Disconnect with a reason code, e.g. [ReasonCode::DisconnectWithWill] to have the broker
    /// publish the will message. Reason and properties are only transmitted with MQTT v5.
    pub async fn disconnect_with(
        &self,
        reason: ReasonCode,
        properties: &[Property],
    ) -> Result<(), Error> {
        let _gate = self.inner.connect_gate.lock().await;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        properties::validate(properties, MessageType::Disconnect)?;
        let mut packet = Disconnect::new(reason);
        packet.properties = properties.to_vec();

        self.inner.log.info(format_args!("Disconnecting"));
        let result = self.inner.channel.send(&Packet::Disconnect(packet)).await;
        self.inner.shutdown(Origin::User).await;
        result
    }

    /// Publish a message.
    ///
    /// # Returns
    /// Once the message was transmitted for QoS 0, acknowledged with PUBACK for QoS 1 or
    /// completed with PUBCOMP for QoS 2.
    ///
    /// # Note
    /// If the acknowledgement does not arrive within the communication timeout the call fails
    /// with [Error::TimedOut], but the message remains in flight and is retransmitted.
    pub async fn publish(&self, message: ApplicationMessage) -> Result<(), Error> {
        let inner = &self.inner;
        if !inner.is_active() {
            return Err(Error::NotConnected);
        }

        {
            let session = inner.session_state.lock();
            if message.qos > session.maximum_qos {
                return Err(Error::Failed(ReasonCode::QosNotSupported));
            }
            if message.retain && !session.retain_available {
                return Err(Error::Failed(ReasonCode::RetainNotSupported));
            }
        }

        inner.log.debug(format_args!(
            "Publishing to `{}` at {:?}",
            message.topic, message.qos
        ));

        let (completion, done) = oneshot::channel();
        let packet = inner
            .engine
            .lock()
            .send(message.to_publish(), Some(completion));

        if let Some(packet) = packet {
            inner.channel.send(&packet).await?;
        }

        match tokio::time::timeout(inner.options.communication_timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Communication(CommunicationError::Disconnected)),
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Subscribe to topics.
    ///
    /// # Args
    /// * `subscriptions` - The filters and their options.
    /// * `properties` - A list of properties to attach to the subscription request. May be empty.
    ///
    /// # Returns
    /// The reason code granted for each subscription, in request order.
    pub async fn subscribe(
        &self,
        subscriptions: &[TopicSubscription],
        properties: &[Property],
    ) -> Result<Vec<ReasonCode>, Error> {
        properties::validate(properties, MessageType::Subscribe)?;

        let packet_id = self.inner.reserve_packet_id()?;
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: subscriptions.to_vec(),
            properties: properties.to_vec(),
        });

        let awaiter = self
            .inner
            .dispatcher
            .register_response(MessageType::SubAck, Some(packet_id));
        let result = self.inner.request(packet, awaiter).await;
        self.inner.engine.lock().release_packet_id(packet_id);

        match result? {
            Packet::SubAck(ack) => {
                self.inner.log.info(format_args!(
                    "Subscribed to {} filters: {:?}",
                    subscriptions.len(),
                    ack.reason_codes
                ));
                Ok(ack.reason_codes)
            }
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    /// Unsubscribe from topic filters.
    ///
    /// # Returns
    /// The reason code for each filter. MQTT 3.x brokers report no codes, so every filter is
    /// reported as [ReasonCode::Success].
    pub async fn unsubscribe(
        &self,
        filters: &[&str],
        properties: &[Property],
    ) -> Result<Vec<ReasonCode>, Error> {
        properties::validate(properties, MessageType::Unsubscribe)?;

        let packet_id = self.inner.reserve_packet_id()?;
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: filters.iter().map(|filter| filter.to_string()).collect(),
            properties: properties.to_vec(),
        });

        let awaiter = self
            .inner
            .dispatcher
            .register_response(MessageType::UnsubAck, Some(packet_id));
        let result = self.inner.request(packet, awaiter).await;
        self.inner.engine.lock().release_packet_id(packet_id);

        match result? {
            Packet::UnsubAck(ack) if ack.reason_codes.is_empty() => {
                Ok(vec![ReasonCode::Success; filters.len()])
            }
            Packet::UnsubAck(ack) => Ok(ack.reason_codes),
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    /// Send a PINGREQ and wait for the PINGRESP.
    pub async fn ping(&self) -> Result<(), Error> {
        let awaiter = self
            .inner
            .dispatcher
            .register_response(MessageType::PingResp, None);
        self.inner.request(Packet::PingReq, awaiter).await?;
        self.inner.session_state.lock().register_ping_response();
        Ok(())
    }

    /// Re-authenticate with the authentication method configured for the connection.
    ///
    /// # Returns
    /// The AUTH packet of the broker, which may ask to continue the exchange.
    pub async fn reauthenticate(&self, data: &[u8]) -> Result<Auth, Error> {
        if self.inner.options.protocol_version != ProtocolVersion::V500 {
            return Err(ProtocolError::UnsupportedPacket.into());
        }

        let method = match &self.inner.options.authentication {
            Some((method, _)) => method.clone(),
            None => return Err(Error::Failed(ReasonCode::BadAuthMethod)),
        };

        let packet = Packet::Auth(Auth {
            reason_code: ReasonCode::ReAuthenticate,
            properties: vec![
                Property::AuthenticationMethod(method),
                Property::AuthenticationData(data.to_vec()),
            ],
        });

        let awaiter = self
            .inner
            .dispatcher
            .register_response(MessageType::Auth, None);
        match self.inner.request(packet, awaiter).await? {
            Packet::Auth(auth) if auth.reason_code.failed() => Err(Error::Failed(auth.reason_code)),
            Packet::Auth(auth) => Ok(auth),
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock();
        for task in [tasks.receiver.take(), tasks.timer.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl ClientInner {
    fn is_active(&self) -> bool {
        matches!(self.connection_state.lock().state(), States::Active)
    }

    fn reserve_packet_id(&self) -> Result<u16, Error> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }

        self.engine
            .lock()
            .reserve_packet_id()
            .ok_or(Error::Failed(ReasonCode::PacketIdInUse))
    }

    async fn request(&self, packet: Packet, awaiter: PacketAwaiter) -> Result<Packet, Error> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }

        self.channel.send(&packet).await?;
        awaiter.wait(self.options.communication_timeout).await
    }

    async fn send_all(&self, packets: Vec<Packet>) -> Result<(), Error> {
        for packet in packets.iter() {
            self.channel.send(packet).await?;
        }

        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> Result<ConnAck, Error> {
        let timeout = self.options.communication_timeout;

        match tokio::time::timeout(timeout, self.channel.transport().connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::TimedOut),
        }

        self.channel.reset().await;
        self.channel.set_version(self.options.protocol_version);
        self.channel.set_maximum_outgoing_packet_size(None);
        self.channel
            .set_maximum_incoming_packet_size(self.options.maximum_packet_size)
            .await;
        self.disconnect_reason.lock().take();

        let mut connect = self.options.connect_packet(self.options.clean_session)?;
        // Reuse an identifier assigned on a previous connection.
        connect.client_id = self.session_state.lock().client_id.clone();

        let awaiter = self
            .dispatcher
            .register_response(MessageType::ConnAck, None);

        let receiver = tokio::spawn(self.clone().receive_loop());
        self.tasks.lock().receiver.replace(receiver);

        self.connection_state
            .lock()
            .process_event(Events::TransportConnected)
            .ok();

        self.log.info(format_args!("Sending CONNECT"));
        self.channel.send(&Packet::Connect(connect)).await?;

        match awaiter.wait(timeout).await? {
            Packet::ConnAck(ack) if ack.reason_code.failed() => {
                self.log.error(format_args!(
                    "Broker refused the connection: {:?}",
                    ack.reason_code
                ));
                Err(Error::Failed(ack.reason_code))
            }
            Packet::ConnAck(ack) => Ok(ack),
            _ => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let error = loop {
            let packet = match self.channel.receive().await {
                Ok(packet) => packet,
                Err(error) => break error,
            };

            if let Err(error) = self.handle_packet(packet).await {
                break error;
            }
        };

        self.log.info(format_args!("Connection lost: {}", error));
        self.shutdown(Origin::Receiver).await;
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<(), Error> {
        // ConnAck packets are received outside of the connection state.
        if let Packet::ConnAck(ack) = &packet {
            self.handle_connection_acknowledge(ack).await?;
            self.dispatcher.try_dispatch(packet);
            return Ok(());
        }

        let Some(packet) = self.dispatcher.try_dispatch(packet) else {
            return Ok(());
        };

        // All other packets must be received in the active state.
        if !self.is_active() {
            self.log.error(format_args!(
                "Received {:?} outside of connected state",
                packet.message_type()
            ));
            return Err(ProtocolError::UnexpectedPacket.into());
        }

        match packet {
            Packet::Publish(publish) => {
                let inbound = self.engine.lock().handle_publish(publish);
                self.complete_inbound(inbound).await
            }
            Packet::PubRel(rel) => {
                let inbound = self.engine.lock().handle_pubrel(&rel);
                self.complete_inbound(inbound).await
            }
            Packet::PubAck(ack) => {
                let packets = self.engine.lock().handle_puback(&ack);
                self.send_all(packets).await
            }
            Packet::PubRec(rec) => {
                let packets = self.engine.lock().handle_pubrec(&rec);
                self.send_all(packets).await
            }
            Packet::PubComp(comp) => {
                let packets = self.engine.lock().handle_pubcomp(&comp);
                self.send_all(packets).await
            }
            Packet::PingResp => {
                self.session_state.lock().register_ping_response();
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                self.log.warn(format_args!(
                    "Broker disconnected: {:?}",
                    disconnect.reason_code
                ));
                self.disconnect_reason
                    .lock()
                    .replace(disconnect.reason_code);
                Err(CommunicationError::Disconnected.into())
            }
            Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::Auth(_) => {
                // The request already timed out.
                self.log.debug(format_args!(
                    "Ignoring unsolicited {:?}",
                    packet.message_type()
                ));
                Ok(())
            }
            Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq => Err(ProtocolError::UnexpectedPacket.into()),
        }
    }

    async fn complete_inbound(&self, inbound: Inbound) -> Result<(), Error> {
        if let Some(publish) = inbound.deliver {
            self.events
                .emit(&ClientEvent::MessageReceived(publish.into()));
        }

        if let Some(reply) = inbound.reply {
            self.channel.send(&reply).await?;
        }

        Ok(())
    }

    async fn handle_connection_acknowledge(
        self: &Arc<Self>,
        acknowledge: &ConnAck,
    ) -> Result<(), Error> {
        if !matches!(self.connection_state.lock().state(), States::Establishing) {
            return Err(ProtocolError::UnexpectedPacket.into());
        }

        // A refusal is reported to the caller of `connect`.
        if acknowledge.reason_code.failed() {
            return Ok(());
        }

        let (receive_maximum, maximum_packet_size, keep_alive) = {
            let mut session = self.session_state.lock();
            session.register_connack(acknowledge);
            (
                session.receive_maximum,
                session.maximum_packet_size,
                session.keep_alive,
            )
        };

        self.channel
            .set_maximum_outgoing_packet_size(maximum_packet_size);

        // Replay in-flight publications.
        let packets = {
            let mut engine = self.engine.lock();
            engine.set_receive_maximum(receive_maximum);
            engine.resume(acknowledge.session_present)
        };

        self.connection_state
            .lock()
            .process_event(Events::ReceivedConnAck)
            .ok();

        self.log.info(format_args!(
            "Connected, session present: {}",
            acknowledge.session_present
        ));

        let timer = tokio::spawn(self.clone().timer_loop(self.timer_period(keep_alive)));
        self.tasks.lock().timer.replace(timer);

        self.events.emit(&ClientEvent::Connected {
            session_present: acknowledge.session_present,
        });

        self.send_all(packets).await
    }

    fn timer_period(&self, keep_alive: Duration) -> Duration {
        let mut period = self
            .options
            .retransmit_interval
            .min(self.options.communication_timeout);
        if !keep_alive.is_zero() {
            period = period.min(keep_alive / 2);
        }

        (period / 2).max(Duration::from_millis(10))
    }

    async fn timer_loop(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(error) = self.handle_timers().await {
                self.log
                    .warn(format_args!("Keep-alive failed: {}", error));
                self.shutdown(Origin::Timer).await;
                return;
            }
        }
    }

    async fn handle_timers(&self) -> Result<(), Error> {
        let now = Instant::now();
        let action = self.session_state.lock().handle_ping(
            self.channel.last_write(),
            now,
            self.options.communication_timeout,
        );

        match action {
            PingAction::TimedOut => return Err(Error::TimedOut),
            PingAction::Send => self.channel.send(&Packet::PingReq).await?,
            PingAction::Idle => {}
        }

        let packets = self.engine.lock().retransmissions(now);
        self.send_all(packets).await
    }

    /// Tear the connection down. Only the first caller performs the teardown.
    async fn shutdown(&self, origin: Origin) {
        let was_connected = {
            let mut state = self.connection_state.lock();
            let was_connected = match state.state() {
                States::Disconnected => return,
                States::Active => true,
                _ => false,
            };
            state.process_event(Events::Disconnect).ok();
            was_connected
        };

        {
            let mut tasks = self.tasks.lock();
            let receiver = tasks.receiver.take();
            let timer = tasks.timer.take();
            if let Some(task) = receiver.filter(|_| origin != Origin::Receiver) {
                task.abort();
            }
            if let Some(task) = timer.filter(|_| origin != Origin::Timer) {
                task.abort();
            }
        }

        self.dispatcher.fail_all();
        self.engine.lock().disconnected();
        self.session_state.lock().register_ping_response();
        self.channel.close().await;

        self.events.emit(&ClientEvent::Disconnected {
            reason: self.disconnect_reason.lock().take(),
            was_connected,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{packets::PubResponse, transport::StreamTransport, QoS};

    fn peer(stream: tokio::io::DuplexStream) -> PacketChannel {
        PacketChannel::new(
            Arc::new(StreamTransport::new(stream)),
            ProtocolVersion::V500,
            Logger::default(),
        )
    }

    async fn accept(broker: &PacketChannel, session_present: bool) {
        match broker.receive().await.unwrap() {
            Packet::Connect(connect) => assert_eq!(connect.client_id, "client"),
            other => panic!("Expected CONNECT, got {:?}", other),
        }

        broker
            .send(&Packet::ConnAck(ConnAck::new(
                ReasonCode::Success,
                session_present,
            )))
            .await
            .unwrap();
    }

    fn options() -> ClientOptions {
        ClientOptions::new("client")
            .keep_alive(Duration::ZERO)
            .retransmit_interval(Duration::from_secs(2))
            .communication_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn connect_and_subscribe() {
        let (local, remote) = tokio::io::duplex(4096);
        let client = MqttClient::new(StreamTransport::new(local), options());
        let broker = peer(remote);

        let (ack, _) = tokio::join!(client.connect(), accept(&broker, false));
        assert!(!ack.unwrap().session_present);
        assert!(client.is_connected());

        let subscriptions = [TopicSubscription::new(
            "a/+",
            crate::types::SubscriptionOptions::new(QoS::AtLeastOnce),
        )];
        let broker_side = async {
            match broker.receive().await.unwrap() {
                Packet::Subscribe(subscribe) => {
                    broker
                        .send(&Packet::SubAck(crate::packets::SubAck {
                            packet_id: subscribe.packet_id,
                            reason_codes: vec![ReasonCode::GrantedQos1],
                            properties: Vec::new(),
                        }))
                        .await
                        .unwrap();
                }
                other => panic!("Expected SUBSCRIBE, got {:?}", other),
            }
        };

        let (codes, _) = tokio::join!(client.subscribe(&subscriptions, &[]), broker_side);
        assert_eq!(codes.unwrap(), vec![ReasonCode::GrantedQos1]);
    }

    #[tokio::test]
    async fn refused_connection() {
        let (local, remote) = tokio::io::duplex(4096);
        let client = MqttClient::new(StreamTransport::new(local), options());
        let broker = peer(remote);

        let broker_side = async {
            broker.receive().await.unwrap();
            broker
                .send(&Packet::ConnAck(ConnAck::new(
                    ReasonCode::NotAuthorized,
                    false,
                )))
                .await
                .unwrap();
        };

        let (result, _) = tokio::join!(client.connect(), broker_side);
        assert!(matches!(
            result,
            Err(Error::Failed(ReasonCode::NotAuthorized))
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn not_connected() {
        let (local, _remote) = tokio::io::duplex(64);
        let client = MqttClient::new(StreamTransport::new(local), options());

        let result = client.publish(ApplicationMessage::new("a", "b")).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(matches!(client.ping().await, Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn qos1_retransmission() {
        let (local, remote) = tokio::io::duplex(4096);
        let client = MqttClient::new(
            StreamTransport::new(local),
            options().communication_timeout(Duration::from_secs(30)),
        );
        let broker = peer(remote);

        let (ack, _) = tokio::join!(client.connect(), accept(&broker, false));
        ack.unwrap();

        let mut message = ApplicationMessage::new("data", "1");
        message.qos = QoS::AtLeastOnce;

        let broker_side = async {
            let first = match broker.receive().await.unwrap() {
                Packet::Publish(publish) => publish,
                other => panic!("Expected PUBLISH, got {:?}", other),
            };
            assert!(!first.dup);

            // Withhold the acknowledgement until the publication is retransmitted.
            let second = match broker.receive().await.unwrap() {
                Packet::Publish(publish) => publish,
                other => panic!("Expected PUBLISH, got {:?}", other),
            };
            assert!(second.dup);
            assert_eq!(second.packet_id, first.packet_id);

            broker
                .send(&Packet::PubAck(PubResponse::new(
                    second.packet_id.unwrap_or_default(),
                )))
                .await
                .unwrap();
        };

        let (result, _) = tokio::join!(client.publish(message), broker_side);
        result.unwrap();
        assert_eq!(client.pending_messages(), 0);
    }

    #[tokio::test]
    async fn broker_disconnect_raises_event() {
        let (local, remote) = tokio::io::duplex(4096);
        let client = MqttClient::new(StreamTransport::new(local), options());
        let broker = peer(remote);

        let (events, mut received) = tokio::sync::mpsc::unbounded_channel();
        client.events().add(move |event: &ClientEvent| {
            events.send(event.clone()).ok();
        });

        let (ack, _) = tokio::join!(client.connect(), accept(&broker, true));
        assert!(ack.unwrap().session_present);

        broker
            .send(&Packet::Disconnect(Disconnect::new(
                ReasonCode::ServerShuttingDown,
            )))
            .await
            .unwrap();

        assert_eq!(
            received.recv().await.unwrap(),
            ClientEvent::Connected {
                session_present: true
            }
        );
        assert_eq!(
            received.recv().await.unwrap(),
            ClientEvent::Disconnected {
                reason: Some(ReasonCode::ServerShuttingDown),
                was_connected: true,
            }
        );
        assert!(!client.is_connected());
    }
}
