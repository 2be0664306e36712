use super::{
    v3::{read, read_packet_id, write, V3Formatter},
    PacketFormatter,
};
use crate::{
    de::MqttDeserializer,
    message_types::MessageType,
    packets::{
        Auth, ConnAck, Connect, Disconnect, PubResponse, Publish, SubAck, Subscribe, UnsubAck,
        Unsubscribe,
    },
    properties::{self, Property},
    reason_codes::ReasonCode,
    ser::MqttSerializer,
    types::{Properties, RawBytes, SubscriptionOptions, TopicSubscription, Utf8String},
    ProtocolError, ProtocolVersion,
};
use bit_field::BitField;
use bytes::Bytes;

/// Formatter for MQTT 5.0.
///
/// The packet structure of MQTT 3.1.1 is reused, with properties and reason codes added.
#[derive(Debug, Copy, Clone)]
pub struct V5Formatter {
    legacy: V3Formatter,
}

impl Default for V5Formatter {
    fn default() -> Self {
        Self::new()
    }
}

impl V5Formatter {
    pub const fn new() -> Self {
        Self {
            legacy: V3Formatter::new(ProtocolVersion::V500),
        }
    }

    fn read_properties(
        &self,
        packet: MessageType,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Vec<Property>, ProtocolError> {
        let properties = properties::read_properties(input)?;
        properties::validate(&properties, packet)?;
        Ok(properties)
    }

    /// Write a reason code and properties that may both be omitted when the reason is
    /// [ReasonCode::Success] and there are no properties.
    fn write_optional_reason(
        &self,
        reason_code: ReasonCode,
        properties: &[Property],
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        if reason_code == ReasonCode::Success && properties.is_empty() {
            return Ok(());
        }

        write(out, &reason_code)?;
        if !properties.is_empty() {
            write(out, &Properties(properties))?;
        }

        Ok(())
    }

    fn read_optional_reason(
        &self,
        packet: MessageType,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<(ReasonCode, Vec<Property>), ProtocolError> {
        if input.is_empty() {
            return Ok((ReasonCode::Success, Vec::new()));
        }

        let reason_code: ReasonCode = read(input)?;
        let properties = if input.is_empty() {
            Vec::new()
        } else {
            self.read_properties(packet, input)?
        };

        Ok((reason_code, properties))
    }
}

impl PacketFormatter for V5Formatter {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V500
    }

    fn encode_connect(
        &self,
        packet: &Connect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        self.legacy.write_connect_header(packet, out)?;
        write(out, &Properties(&packet.properties))?;
        write(out, &Utf8String(&packet.client_id))?;

        if let Some(will) = &packet.will {
            write(out, &Properties(&will.properties))?;
            self.legacy.write_will_message(will, out)?;
        }

        self.legacy.write_credentials(packet, out)
    }

    fn encode_connack(
        &self,
        packet: &ConnAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &(packet.session_present as u8))?;
        write(out, &packet.reason_code)?;
        write(out, &Properties(&packet.properties))
    }

    fn encode_publish(
        &self,
        packet: &Publish,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        self.legacy.write_publish_header(packet, out)?;
        write(out, &Properties(&packet.properties))?;
        write(out, &RawBytes(&packet.payload))
    }

    fn encode_pub_response(
        &self,
        packet: &PubResponse,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        self.write_optional_reason(packet.reason_code, &packet.properties, out)
    }

    fn encode_subscribe(
        &self,
        packet: &Subscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        write(out, &Properties(&packet.properties))?;
        for subscription in packet.subscriptions.iter() {
            write(out, &Utf8String(&subscription.filter))?;
            write(out, &subscription.options.as_byte())?;
        }

        Ok(())
    }

    fn encode_suback(
        &self,
        packet: &SubAck,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        write(out, &Properties(&packet.properties))?;
        for code in packet.reason_codes.iter() {
            write(out, code)?;
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        write(out, &packet.packet_id)?;
        write(out, &Properties(&packet.properties))?;
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
        write(out, &packet.packet_id)?;
        write(out, &Properties(&packet.properties))?;
        for code in packet.reason_codes.iter() {
            write(out, code)?;
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        out: &mut MqttSerializer,
    ) -> Result<(), ProtocolError> {
        self.write_optional_reason(packet.reason_code, &packet.properties, out)
    }

    fn encode_auth(&self, packet: &Auth, out: &mut MqttSerializer) -> Result<(), ProtocolError> {
        self.write_optional_reason(packet.reason_code, &packet.properties, out)
    }

    fn decode_connect(&self, input: &mut MqttDeserializer<'_>) -> Result<Connect, ProtocolError> {
        let header = self.legacy.read_connect_header(input)?;
        let properties = self.read_properties(MessageType::Connect, input)?;

        let mut connect = Connect::new(read::<String>(input)?, ProtocolVersion::V500);
        connect.clean_session = header.flags.get_bit(1);
        connect.keep_alive = header.keep_alive;
        connect.properties = properties;

        if header.has_will() {
            let will_properties = properties::read_properties(input)?;
            if !will_properties.iter().all(Property::allowed_in_will) {
                return Err(ProtocolError::PropertyNotAllowed);
            }

            let mut will = self.legacy.read_will_message(&header, input)?;
            will.properties = will_properties;
            connect.will = Some(will);
        }

        self.legacy.read_credentials(&header, &mut connect, input)?;
        connect.validate()?;
        Ok(connect)
    }

    fn decode_connack(&self, input: &mut MqttDeserializer<'_>) -> Result<ConnAck, ProtocolError> {
        let flags: u8 = read(input)?;
        if flags.get_bits(1..=7) != 0 {
            return Err(ProtocolError::MalformedPacket);
        }

        let reason_code: ReasonCode = read(input)?;
        let properties = if input.is_empty() {
            Vec::new()
        } else {
            self.read_properties(MessageType::ConnAck, input)?
        };

        Ok(ConnAck {
            session_present: flags.get_bit(0),
            reason_code,
            properties,
        })
    }

    fn decode_publish(
        &self,
        flags: u8,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Publish, ProtocolError> {
        let mut publish = self.legacy.read_publish_header(flags, input)?;
        publish.properties = self.read_properties(MessageType::Publish, input)?;
        publish.payload = Bytes::copy_from_slice(input.remainder());
        publish.validate()?;
        Ok(publish)
    }

    fn decode_pub_response(
        &self,
        kind: MessageType,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<PubResponse, ProtocolError> {
        let packet_id = read_packet_id(input)?;
        let (reason_code, properties) = self.read_optional_reason(kind, input)?;

        Ok(PubResponse {
            packet_id,
            reason_code,
            properties,
        })
    }

    fn decode_subscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Subscribe, ProtocolError> {
        let packet_id = read_packet_id(input)?;
        let properties = self.read_properties(MessageType::Subscribe, input)?;

        let mut subscriptions = Vec::new();
        while !input.is_empty() {
            let filter: String = read(input)?;
            let options = SubscriptionOptions::from_byte(read(input)?, true)?;
            subscriptions.push(TopicSubscription { filter, options });
        }

        let subscribe = Subscribe {
            packet_id,
            subscriptions,
            properties,
        };
        subscribe.validate()?;
        Ok(subscribe)
    }

    fn decode_suback(&self, input: &mut MqttDeserializer<'_>) -> Result<SubAck, ProtocolError> {
        let packet_id = read_packet_id(input)?;
        let properties = self.read_properties(MessageType::SubAck, input)?;

        let mut reason_codes = Vec::new();
        while !input.is_empty() {
            reason_codes.push(read::<ReasonCode>(input)?);
        }

        Ok(SubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }

    fn decode_unsubscribe(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Unsubscribe, ProtocolError> {
        let packet_id = read_packet_id(input)?;
        let properties = self.read_properties(MessageType::Unsubscribe, input)?;

        let mut filters = Vec::new();
        while !input.is_empty() {
            filters.push(read::<String>(input)?);
        }

        let unsubscribe = Unsubscribe {
            packet_id,
            filters,
            properties,
        };
        unsubscribe.validate()?;
        Ok(unsubscribe)
    }

    fn decode_unsuback(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<UnsubAck, ProtocolError> {
        let packet_id = read_packet_id(input)?;
        let properties = self.read_properties(MessageType::UnsubAck, input)?;

        let mut reason_codes = Vec::new();
        while !input.is_empty() {
            reason_codes.push(read::<ReasonCode>(input)?);
        }

        Ok(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }

    fn decode_disconnect(
        &self,
        input: &mut MqttDeserializer<'_>,
    ) -> Result<Disconnect, ProtocolError> {
        let (reason_code, properties) =
            self.read_optional_reason(MessageType::Disconnect, input)?;
        Ok(Disconnect {
            reason_code,
            properties,
        })
    }

    fn decode_auth(&self, input: &mut MqttDeserializer<'_>) -> Result<Auth, ProtocolError> {
        let (reason_code, properties) = self.read_optional_reason(MessageType::Auth, input)?;
        Ok(Auth {
            reason_code,
            properties,
        })
    }
}
