//! Owned representations of every MQTT control packet.
//!
//! The structures are shared by all protocol revisions. Fields that only exist in MQTT v5, such
//! as properties and most reason codes, are ignored when a packet is encoded for an older
//! revision and take their default values when decoded from one.
use crate::{
    message_types::MessageType, properties::Property, reason_codes::ReasonCode,
    topic, types::TopicSubscription, will::Will, ProtocolError, ProtocolVersion, QoS,
};
use bit_field::BitField;
use bytes::Bytes;

/// Packets that carry a packet identifier.
pub trait PacketIdentifier {
    /// The identifier of the packet, if one is present.
    fn packet_id(&self) -> Option<u16>;
}

/// An MQTT CONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// The protocol revision requested by the client.
    pub protocol_version: ProtocolVersion,

    /// The ID of the client that is connecting. May be an empty string to automatically allocate
    /// an ID from the broker.
    pub client_id: String,

    /// Specified true if there is no session state being taken in to the MQTT connection.
    pub clean_session: bool,

    /// Specifies the keep-alive interval of the connection in seconds.
    pub keep_alive: u16,

    pub username: Option<String>,
    pub password: Option<Vec<u8>>,

    /// An optional will message to be transmitted whenever the connection is lost.
    pub will: Option<Will>,

    /// MQTT 3.1 bridges mark their connections by setting the top bit of the protocol level.
    pub try_private: bool,

    /// Any properties associated with the CONNECT request.
    pub properties: Vec<Property>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 0,
            username: None,
            password: None,
            will: None,
            try_private: false,
            properties: Vec::new(),
        }
    }

    /// Check the invariants of a CONNECT packet.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(ProtocolError::EmptyClientIdWithoutCleanSession);
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(ProtocolError::PasswordWithoutUsername);
        }

        if let Some(will) = &self.will {
            will.validate()?;
        }

        Ok(())
    }

    /// The connect flags byte.
    pub(crate) fn flags(&self) -> u8 {
        let mut flags: u8 = 0;
        flags.set_bit(1, self.clean_session);

        if let Some(will) = &self.will {
            // Indicate that the will is present, the QoS of the will message, and whether or not
            // the will message should be retained.
            flags.set_bit(2, true);
            flags.set_bits(3..=4, will.qos as u8);
            flags.set_bit(5, will.retain);
        }

        flags.set_bit(6, self.password.is_some());
        flags.set_bit(7, self.username.is_some());
        flags
    }
}

/// An MQTT CONNACK packet, representing a connection acknowledgement from a broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    /// Indicates true if session state is being maintained by the broker.
    pub session_present: bool,

    /// A status code indicating the success status of the connection.
    pub reason_code: ReasonCode,

    /// A list of properties associated with the connection.
    pub properties: Vec<Property>,
}

impl ConnAck {
    pub fn new(reason_code: ReasonCode, session_present: bool) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Vec::new(),
        }
    }
}

/// An MQTT PUBLISH packet, containing data to be sent or received.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// The topic that the message was published on.
    pub topic: String,

    /// The identifier of the exchange. Only present for QoS 1 and 2.
    pub packet_id: Option<u16>,

    /// The message to be transmitted.
    pub payload: Bytes,

    /// Specifies the quality-of-service of the transmission.
    pub qos: QoS,

    /// Specifies whether or not the message should be retained on the broker.
    pub retain: bool,

    /// Specified true if this message is a duplicate (e.g. it has already been transmitted).
    pub dup: bool,

    /// The properties transmitted with the publish data.
    pub properties: Vec<Property>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            properties: Vec::new(),
        }
    }

    /// Check the flag and identifier invariants of a PUBLISH packet.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.dup && self.qos == QoS::AtMostOnce {
            return Err(ProtocolError::DupFlagWithoutQoS);
        }

        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, Some(_)) => return Err(ProtocolError::UnexpectedPacketIdentifier),
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None | Some(0)) => {
                return Err(ProtocolError::MissingPacketIdentifier)
            }
            _ => {}
        }

        // Topic aliases may replace the topic name entirely in MQTT v5.
        let aliased = self
            .properties
            .iter()
            .any(|prop| matches!(prop, Property::TopicAlias(_)));
        if !(aliased && self.topic.is_empty()) {
            topic::validate_topic_name(&self.topic)?;
        }

        Ok(())
    }

    /// The fixed header flags of the packet.
    pub(crate) fn flags(&self) -> u8 {
        *0u8.set_bit(3, self.dup)
            .set_bits(1..=2, self.qos as u8)
            .set_bit(0, self.retain)
    }
}

impl PacketIdentifier for Publish {
    fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }
}

/// The acknowledgement packets of the publish handshakes: PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq)]
pub struct PubResponse {
    /// The ID of the publication being acknowledged.
    pub packet_id: u16,

    /// The success status of the acknowledgement. Always [ReasonCode::Success] before MQTT v5.
    pub reason_code: ReasonCode,

    pub properties: Vec<Property>,
}

impl PubResponse {
    pub fn new(packet_id: u16) -> Self {
        Self::with_reason(packet_id, ReasonCode::Success)
    }

    pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Vec::new(),
        }
    }
}

impl PacketIdentifier for PubResponse {
    fn packet_id(&self) -> Option<u16> {
        Some(self.packet_id)
    }
}

/// An MQTT SUBSCRIBE control packet
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    /// Specifies the ID of this subscription request.
    pub packet_id: u16,

    /// A list of topic filters and associated subscription options for the subscription request.
    pub subscriptions: Vec<TopicSubscription>,

    /// A list of properties associated with the subscription.
    pub properties: Vec<Property>,
}

impl Subscribe {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.packet_id == 0 {
            return Err(ProtocolError::MissingPacketIdentifier);
        }

        if self.subscriptions.is_empty() {
            return Err(ProtocolError::EmptySubscription);
        }

        Ok(())
    }
}

impl PacketIdentifier for Subscribe {
    fn packet_id(&self) -> Option<u16> {
        Some(self.packet_id)
    }
}

/// An MQTT SUBACK control packet.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    /// The identifier that the acknowledge is associated with.
    pub packet_id: u16,

    /// One status code per requested topic filter, in request order.
    pub reason_codes: Vec<ReasonCode>,

    /// The optional properties associated with the acknowledgement.
    pub properties: Vec<Property>,
}

impl PacketIdentifier for SubAck {
    fn packet_id(&self) -> Option<u16> {
        Some(self.packet_id)
    }
}

/// An MQTT UNSUBSCRIBE control packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Vec<Property>,
}

impl Unsubscribe {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.packet_id == 0 {
            return Err(ProtocolError::MissingPacketIdentifier);
        }

        if self.filters.is_empty() {
            return Err(ProtocolError::EmptySubscription);
        }

        Ok(())
    }
}

impl PacketIdentifier for Unsubscribe {
    fn packet_id(&self) -> Option<u16> {
        Some(self.packet_id)
    }
}

/// An MQTT UNSUBACK control packet.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubAck {
    pub packet_id: u16,

    /// One status code per filter in MQTT v5. Empty for older revisions.
    pub reason_codes: Vec<ReasonCode>,

    pub properties: Vec<Property>,
}

impl PacketIdentifier for UnsubAck {
    fn packet_id(&self) -> Option<u16> {
        Some(self.packet_id)
    }
}

/// An MQTT DISCONNECT control packet
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    /// The success status of the disconnection.
    pub reason_code: ReasonCode,

    /// Properties associated with the disconnection.
    pub properties: Vec<Property>,
}

impl Disconnect {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Vec::new(),
        }
    }
}

/// An MQTT v5 AUTH control packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Vec<Property>,
}

/// Every MQTT control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubResponse),
    PubRec(PubResponse),
    PubRel(PubResponse),
    PubComp(PubResponse),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Connect(_) => MessageType::Connect,
            Packet::ConnAck(_) => MessageType::ConnAck,
            Packet::Publish(_) => MessageType::Publish,
            Packet::PubAck(_) => MessageType::PubAck,
            Packet::PubRec(_) => MessageType::PubRec,
            Packet::PubRel(_) => MessageType::PubRel,
            Packet::PubComp(_) => MessageType::PubComp,
            Packet::Subscribe(_) => MessageType::Subscribe,
            Packet::SubAck(_) => MessageType::SubAck,
            Packet::Unsubscribe(_) => MessageType::Unsubscribe,
            Packet::UnsubAck(_) => MessageType::UnsubAck,
            Packet::PingReq => MessageType::PingReq,
            Packet::PingResp => MessageType::PingResp,
            Packet::Disconnect(_) => MessageType::Disconnect,
            Packet::Auth(_) => MessageType::Auth,
        }
    }

    /// The type-specific flags of the fixed header.
    pub fn fixed_header_flags(&self) -> u8 {
        match self {
            Packet::Publish(publish) => publish.flags(),
            other => other.message_type().required_flags().unwrap_or(0),
        }
    }
}

impl PacketIdentifier for Packet {
    fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id(),
            Packet::PubAck(ack)
            | Packet::PubRec(ack)
            | Packet::PubRel(ack)
            | Packet::PubComp(ack) => ack.packet_id(),
            Packet::Subscribe(subscribe) => subscribe.packet_id(),
            Packet::SubAck(ack) => ack.packet_id(),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.packet_id(),
            Packet::UnsubAck(ack) => ack.packet_id(),
            Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::PingReq
            | Packet::PingResp
            | Packet::Disconnect(_)
            | Packet::Auth(_) => None,
        }
    }
}
