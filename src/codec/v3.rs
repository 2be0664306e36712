use super::PacketFormatter;
use crate::{
    de::MqttDeserializer,
    message_types::MessageType,
    packets::{
        Auth, ConnAck, Connect, Disconnect, PubResponse, Publish, SubAck, Subscribe, UnsubAck,
        Unsubscribe,
    },
    reason_codes::ReasonCode,
    ser::MqttSerializer,
    types::{BinaryData, RawBytes, SubscriptionOptions, TopicSubscription, Utf8String},
    will::Will,
    ProtocolError, ProtocolVersion, QoS,
};
use bit_field::BitField;
use bytes::Bytes;
use core::convert::TryFrom;
use serde::{Deserialize, Serialize};

/// Bit 7 of the protocol level, set by MQTT 3.1 bridges.
const TRY_PRIVATE: u8 = 0x80;

pub(crate) fn write<T: Serialize + ?Sized>(
    out: &mut MqttSerializer,
    value: &T,
) -> Result<(), ProtocolError> {
    value.serialize(&mut *out)?;
    Ok(())
}

pub(crate) fn read<'de, T: Deserialize<'de>>(
    input: &mut MqttDeserializer<'de>,
) -> Result<T, ProtocolError> {
    Ok(T::deserialize(&mut *input)?)
}

/// Read a non-zero packet identifier.
pub(crate) fn read_packet_id(input: &mut MqttDeserializer<'_>) -> Result<u16, ProtocolError> {
    match read::<u16>(input)? {
        0 => Err(ProtocolError::MissingPacketIdentifier),
        id => Ok(id),
    }
}

/// Read the protocol name and level at the start of a CONNECT body.
///
/// # Returns
/// The protocol revision and whether the MQTT 3.1 bridge bit was set.
pub(crate) fn read_protocol(
    input: &mut MqttDeserializer<'_>,
) -> Result<(ProtocolVersion, bool), ProtocolError> {
    let name: &str = read(input)?;
    let level: u8 = read(input)?;

    let try_private = level.get_bit(7);
    let version = ProtocolVersion::try_from(level & !TRY_PRIVATE)
        .map_err(|_| ProtocolError::UnsupportedProtocolVersion)?;

    if name != "MQTT" && name != "MQIsdp" {
        return Err(ProtocolError::InvalidProtocolName);
    }

    if name != version.protocol_name() {
        return Err(ProtocolError::UnsupportedProtocolVersion);
    }

    Ok((version, try_private))
}

/// The connect flags and keep-alive following the protocol level of a CONNECT.
pub(crate) struct ConnectHeader {
    pub flags: u8,
    pub keep_alive: u16,
    pub try_private: bool,
}

impl ConnectHeader {
    pub fn has_will(&self) -> bool {
        self.flags.get_bit(2)
    }

    pub fn has_username(&self) -> bool {
        self.flags.get_bit(7)
    }

    pub fn has_password(&self) -> bool {
        self.flags.get_bit(6)
    }
}

/// Formatter for MQTT 3.1 and 3.1.1.
#[derive(Debug, Copy, Clone)]
pub struct V3Formatter {
    version: ProtocolVersion,
}

impl V3Formatter {
    pub const fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub(crate) fn write_connect_header(
        &self,
        packet: &Connect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        let mut level = self.version as u8;
        if self.version == ProtocolVersion::V310 && packet.try_private {
            level |= TRY_PRIVATE;
        }

        write(out, &Utf8String(self.version.protocol_name()))?;
        write(out, &level)?;
        write(out, &packet.flags())?;
        write(out, &packet.keep_alive)
    }

    pub(crate) fn write_will_message(
        &self,
        will: &Will,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &Utf8String(&will.topic))?;
        write(out, &BinaryData(&will.payload))
    }

    pub(crate) fn write_credentials(
        &self,
        packet: &Connect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        if let Some(username) = &packet.username {
            write(out, &Utf8String(username))?;
        }

        if let Some(password) = &packet.password {
            write(out, &BinaryData(password))?;
        }

        Ok(())
    }

    pub(crate) fn read_connect_header(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<ConnectHeader, ProtocolError> {
        let (version, try_private) = read_protocol(input)?;
        if version != self.version {
            return Err(ProtocolError::UnsupportedProtocolVersion);
        }

        let flags: u8 = read(input)?;
        if flags.get_bit(0) {
            return Err(ProtocolError::ReservedFlagSet);
        }

        if flags.get_bits(3..=4) == 3 {
            return Err(ProtocolError::InvalidQoS);
        }

        // The will QoS and retain flags must be cleared when no will is present.
        if !flags.get_bit(2) && (flags.get_bits(3..=4) != 0 || flags.get_bit(5)) {
            return Err(ProtocolError::MalformedPacket);
        }

        Ok(ConnectHeader {
            flags,
            keep_alive: read(input)?,
            try_private,
        })
    }

    pub(crate) fn read_will_message(
        &self,
        header: &ConnectHeader,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Will, ProtocolError> {
        let topic: String = read(input)?;
        let payload: BinaryData = read(input)?;

        Ok(Will {
            topic,
            payload: Bytes::copy_from_slice(payload.0),
            qos: QoS::try_from(header.flags.get_bits(3..=4))
                .map_err(|_| ProtocolError::InvalidQoS)?,
            retain: header.flags.get_bit(5),
            properties: Vec::new(),
        })
    }

    pub(crate) fn read_credentials(
        &self,
        header: &ConnectHeader,
        connect: &mut Connect,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<(), ProtocolError> {
        if header.has_username() {
            connect.username = Some(read(input)?);
        }

        if header.has_password() {
            let password: BinaryData = read(input)?;
            connect.password = Some(password.0.to_vec());
        }

        Ok(())
    }

    pub(crate) fn write_publish_header(
        &self,
        packet: &Publish,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &Utf8String(&packet.topic))?;

        // Packet identifiers are absent unless a QoS requiring IDs is specified.
        if let Some(id) = packet.packet_id {
            write(out, &id)?;
        }

        Ok(())
    }

    pub(crate) fn read_publish_header(
        &self,
        flags: u8,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Publish, ProtocolError> {
        let qos = QoS::try_from(flags.get_bits(1..=2)).map_err(|_| ProtocolError::InvalidQoS)?;
        let topic: String = read(input)?;

        let packet_id = if qos > QoS::AtMostOnce {
            Some(read_packet_id(input)?)
        } else {
            None
        };

        Ok(Publish {
            topic,
            packet_id,
            payload: Bytes::new(),
            qos,
            retain: flags.get_bit(0),
            dup: flags.get_bit(3),
            properties: Vec::new(),
        })
    }
}

impl PacketFormatter for V3Formatter {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn encode_connect(
        &self,
        packet: &Connect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        self.write_connect_header(packet, out)?;
        write(out, &Utf8String(&packet.client_id))?;

        if let Some(will) = &packet.will {
            self.write_will_message(will, out)?;
        }

        self.write_credentials(packet, out)
    }

    fn encode_connack(
        &self,
        packet: &ConnAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        // MQTT 3.1 has a reserved byte in place of the acknowledge flags.
        let flags = self.version != ProtocolVersion::V310 && packet.session_present;
        write(out, &(flags as u8))?;
        write(out, &packet.reason_code.to_connack_return_code())
    }

    fn encode_publish(
        &self,
        packet: &Publish,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        self.write_publish_header(packet, out)?;
        write(out, &RawBytes(&packet.payload))
    }

    fn encode_pub_response(
        &self,
        packet: &PubResponse,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)
    }

    fn encode_subscribe(
        &self,
        packet: &Subscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        for subscription in packet.subscriptions.iter() {
            write(out, &Utf8String(&subscription.filter))?;
            write(out, &(subscription.options.qos as u8))?;
        }

        Ok(())
    }

    fn encode_suback(
        &self,
        packet: &SubAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        for code in packet.reason_codes.iter() {
            write(out, &code.to_legacy_suback_code())?;
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        for filter in packet.filters.iter() {
            write(out, &Utf8String(filter))?;
        }

        Ok(())
    }

    fn encode_unsuback(
        &self,
        packet: &UnsubAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)
    }

    fn encode_disconnect(
        &self,
        _packet: &Disconnect,
        _out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn encode_auth(&self, _packet: &Auth, _out: &mut MqttSerializer) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnsupportedPacket)
    }

    fn decode_connect(&self, input: &mut MqttDeserializer<'_>) -> Result<Connect, ProtocolError> {
        let header = self.read_connect_header(input)?;

        let mut connect = Connect::new(read::<String>(input)?, self.version);
        connect.clean_session = header.flags.get_bit(1);
        connect.keep_alive = header.keep_alive;
        connect.try_private = header.try_private;

        if header.has_will() {
            connect.will = Some(self.read_will_message(&header, input)?);
        }

        self.read_credentials(&header, &mut connect, input)?;
        connect.validate()?;
        Ok(connect)
    }

    fn decode_connack(&self, input: &mut MqttDeserializer<'_>) -> Result<ConnAck, ProtocolError> {
        let flags: u8 = read(input)?;
        let code: u8 = read(input)?;

        let session_present = match self.version {
            ProtocolVersion::V310 => false,
            _ => {
                if flags.get_bits(1..=7) != 0 {
                    return Err(ProtocolError::MalformedPacket);
                }
                flags.get_bit(0)
            }
        };

        Ok(ConnAck::new(
            ReasonCode::from_connack_return_code(code),
            session_present,
        ))
    }

    fn decode_publish(
        &self,
        flags: u8,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Publish, ProtocolError> {
        let mut publish = self.read_publish_header(flags, input)?;
        publish.payload = Bytes::copy_from_slice(input.remainder());
        publish.validate()?;
        Ok(publish)
    }

    fn decode_pub_response(
        &self,
        _kind: MessageType,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<PubResponse, ProtocolError> {
        Ok(PubResponse::new(read_packet_id(input)?))
    }

    fn decode_subscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Subscribe, ProtocolError> {
        let packet_id = read_packet_id(input)?;

        let mut subscriptions = Vec::new();
        while !input.is_empty() {
            let filter: String = read(input)?;
            let options = SubscriptionOptions::from_byte(read(input)?, false)?;
            subscriptions.push(TopicSubscription { filter, options });
        }

        let subscribe = Subscribe {
            packet_id,
            subscriptions,
            properties: Vec::new(),
        };
        subscribe.validate()?;
        Ok(subscribe)
    }

    fn decode_suback(&self, input: &mut MqttDeserializer<'_>) -> Result<SubAck, ProtocolError> {
        let packet_id = read_packet_id(input)?;

        let mut reason_codes = Vec::new();
        while !input.is_empty() {
            reason_codes.push(read::<ReasonCode>(input)?);
        }

        Ok(SubAck {
            packet_id,
            reason_codes,
            properties: Vec::new(),
        })
    }

    fn decode_unsubscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Unsubscribe, ProtocolError> {
        let packet_id = read_packet_id(input)?;

        let mut filters = Vec::new();
        while !input.is_empty() {
            filters.push(read::<String>(input)?);
        }

        let unsubscribe = Unsubscribe {
            packet_id,
            filters,
            properties: Vec::new(),
        };
        unsubscribe.validate()?;
        Ok(unsubscribe)
    }

    fn decode_unsuback(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<UnsubAck, ProtocolError> {
        Ok(UnsubAck {
            packet_id: read_packet_id(input)?,
            reason_codes: Vec::new(),
            properties: Vec::new(),
        })
    }

    fn decode_disconnect(
        &self,
        _input: &mut MqttDeserializer<'_>,
    ) -> Result<Disconnect, ProtocolError> {
        Ok(Disconnect::new(ReasonCode::Success))
    }

    fn decode_auth(&self, _input: &mut MqttDeserializer<'_>) -> Result<Auth, ProtocolError> {
        Err(ProtocolError::UnsupportedPacket)
    }
}
