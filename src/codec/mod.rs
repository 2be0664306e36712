//! Version-aware MQTT packet encoding and decoding.
//!
//! Every protocol revision is handled by a formatter implementing [PacketFormatter]. The
//! formatters share a single dispatch over [Packet] variants, so every packet type is handled
//! exhaustively for every revision. MQTT v5 wraps the 3.1.1 structure and adds properties and
//! reason codes.
mod v3;
mod v5;

pub use v3::V3Formatter;
pub use v5::V5Formatter;

use crate::{
    de::{FixedHeader, MqttDeserializer},
    message_types::MessageType,
    packets::{
        Auth, ConnAck, Connect, Disconnect, Packet, PubResponse, Publish, SubAck, Subscribe,
        UnsubAck, Unsubscribe,
    },
    ser::MqttSerializer,
    ProtocolError, ProtocolVersion,
};

/// Per-revision encoding and decoding of packet bodies.
///
/// The fixed header is handled by [encode] and [decode].
pub trait PacketFormatter: Send + Sync {
    fn version(&self) -> ProtocolVersion;

    fn encode_connect(&self, packet: &Connect, out: &mut MqttSerializer)
        -> Result<(), ProtocolError>;
    fn encode_connack(&self, packet: &ConnAck, out: &mut MqttSerializer)
        -> Result<(), ProtocolError>;
    fn encode_publish(&self, packet: &Publish, out: &mut MqttSerializer)
        -> Result<(), ProtocolError>;
    fn encode_pub_response(
        &self,
        packet: &PubResponse,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError>;
    fn encode_subscribe(
        &self,
        packet: &Subscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError>;
    fn encode_suback(&self, packet: &SubAck, out: &mut MqttSerializer)
        -> Result<(), ProtocolError>;
    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError>;
    fn encode_unsuback(
        &self,
        packet: &UnsubAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError>;
    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError>;
    fn encode_auth(&self, packet: &Auth, out: &mut MqttSerializer) -> Result<(), ProtocolError>;

    fn decode_connect(&self, input: &mut MqttDeserializer<'_>) -> Result<Connect, ProtocolError>;
    fn decode_connack(&self, input: &mut MqttDeserializer<'_>) -> Result<ConnAck, ProtocolError>;
    fn decode_publish(
        &self,
        flags: u8,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Publish, ProtocolError>;
    fn decode_pub_response(
        &self,
        kind: MessageType,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<PubResponse, ProtocolError>;
    fn decode_subscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Subscribe, ProtocolError>;
    fn decode_suback(&self, input: &mut MqttDeserializer<'_>) -> Result<SubAck, ProtocolError>;
    fn decode_unsubscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Unsubscribe, ProtocolError>;
    fn decode_unsuback(&self, input: &mut MqttDeserializer<'_>)
        -> Result<UnsubAck, ProtocolError>;
    fn decode_disconnect(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Disconnect, ProtocolError>;
    fn decode_auth(&self, input: &mut MqttDeserializer<'_>) -> Result<Auth, ProtocolError>;
}

static MQTT_V310: V3Formatter = V3Formatter::new(ProtocolVersion::V310);
static MQTT_V311: V3Formatter = V3Formatter::new(ProtocolVersion::V311);
static MQTT_V500: V5Formatter = V5Formatter::new();

/// Get the formatter responsible for a protocol revision.
pub fn formatter(version: ProtocolVersion) -> &'static dyn PacketFormatter {
    match version {
        ProtocolVersion::V310 => &MQTT_V310,
        ProtocolVersion::V311 => &MQTT_V311,
        ProtocolVersion::V500 => &MQTT_V500,
    }
}

/// Serialize a packet, including its fixed header.
pub fn encode(packet: &Packet, version: ProtocolVersion) -> Result<Vec<u8>, ProtocolError> {
    let formatter = formatter(version);
    let mut out = MqttSerializer::new();

    match packet {
        Packet::Connect(connect) => {
            connect.validate()?;
            formatter.encode_connect(connect, &mut out)?
        }
        Packet::ConnAck(connack) => formatter.encode_connack(connack, &mut out)?,
        Packet::Publish(publish) => {
            publish.validate()?;
            formatter.encode_publish(publish, &mut out)?
        }
        Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubRel(ack) | Packet::PubComp(ack) => {
            if ack.packet_id == 0 {
                return Err(ProtocolError::MissingPacketIdentifier);
            }
            formatter.encode_pub_response(ack, &mut out)?
        }
        Packet::Subscribe(subscribe) => {
            subscribe.validate()?;
            formatter.encode_subscribe(subscribe, &mut out)?
        }
        Packet::SubAck(suback) => formatter.encode_suback(suback, &mut out)?,
        Packet::Unsubscribe(unsubscribe) => {
            unsubscribe.validate()?;
            formatter.encode_unsubscribe(unsubscribe, &mut out)?
        }
        Packet::UnsubAck(unsuback) => formatter.encode_unsuback(unsuback, &mut out)?,
        Packet::PingReq | Packet::PingResp => {}
        Packet::Disconnect(disconnect) => formatter.encode_disconnect(disconnect, &mut out)?,
        Packet::Auth(auth) => formatter.encode_auth(auth, &mut out)?,
    }

    Ok(out.finalize(packet.message_type(), packet.fixed_header_flags())?)
}

/// Parse a packet body received with the provided fixed header.
pub fn decode(
    header: &FixedHeader,
    body: &[u8],
    version: ProtocolVersion,
) -> Result<Packet, ProtocolError> {
    if body.len() != header.remaining_length {
        return Err(ProtocolError::RemainingLengthInvalid);
    }

    let formatter = formatter(version);
    let mut input = MqttDeserializer::new(body);

    let packet = match header.message_type {
        MessageType::Connect => Packet::Connect(formatter.decode_connect(&mut input)?),
        MessageType::ConnAck => Packet::ConnAck(formatter.decode_connack(&mut input)?),
        MessageType::Publish => {
            Packet::Publish(formatter.decode_publish(header.flags, &mut input)?)
        }
        MessageType::PubAck => {
            Packet::PubAck(formatter.decode_pub_response(MessageType::PubAck, &mut input)?)
        }
        MessageType::PubRec => {
            Packet::PubRec(formatter.decode_pub_response(MessageType::PubRec, &mut input)?)
        }
        MessageType::PubRel => {
            Packet::PubRel(formatter.decode_pub_response(MessageType::PubRel, &mut input)?)
        }
        MessageType::PubComp => {
            Packet::PubComp(formatter.decode_pub_response(MessageType::PubComp, &mut input)?)
        }
        MessageType::Subscribe => Packet::Subscribe(formatter.decode_subscribe(&mut input)?),
        MessageType::SubAck => Packet::SubAck(formatter.decode_suback(&mut input)?),
        MessageType::Unsubscribe => {
            Packet::Unsubscribe(formatter.decode_unsubscribe(&mut input)?)
        }
        MessageType::UnsubAck => Packet::UnsubAck(formatter.decode_unsuback(&mut input)?),
        MessageType::PingReq => Packet::PingReq,
        MessageType::PingResp => Packet::PingResp,
        MessageType::Disconnect => Packet::Disconnect(formatter.decode_disconnect(&mut input)?),
        MessageType::Auth => Packet::Auth(formatter.decode_auth(&mut input)?),
    };

    if !input.is_empty() {
        crate::warn!(
            "{:?} packet has {} trailing bytes",
            header.message_type,
            input.len()
        );
        return Err(ProtocolError::MalformedPacket);
    }

    crate::trace!("Decoded {:?}", packet);
    Ok(packet)
}

/// Determine the protocol revision of a CONNECT packet body from its protocol name and level.
///
/// # Note
/// This is used by servers on the first packet of a connection, before the revision used for
/// the rest of the connection is known.
pub fn detect_version(body: &[u8]) -> Result<ProtocolVersion, ProtocolError> {
    let mut input = MqttDeserializer::new(body);
    let (version, _) = v3::read_protocol(&mut input)?;
    Ok(version)
}
