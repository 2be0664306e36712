use crate::{
    de::MqttDeserializer,
    message_types::MessageType,
    types::{BinaryData, Utf8String},
    varint::Varint,
    ProtocolError,
};

use core::convert::TryFrom;
use num_enum::TryFromPrimitive;
use serde::{ser::SerializeStruct, Deserialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum PropertyIdentifier {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,

    ResponseTopic = 0x08,
    CorrelationData = 0x09,

    SubscriptionIdentifier = 0x0B,

    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,

    ResponseInformation = 0x1A,

    ServerReference = 0x1C,

    ReasonString = 0x1F,

    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// All of the possible properties that MQTT version 5 supports.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Vec<u8>),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Vec<u8>),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

struct PropertyVisitor;

impl<'de> serde::de::Visitor<'de> for PropertyVisitor {
    type Value = Property;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "enum Property")
    }

    fn visit_enum<A: serde::de::EnumAccess<'de>>(self, data: A) -> Result<Self::Value, A::Error> {
        use serde::de::{Error, VariantAccess};

        let (field, variant) = data.variant::<u8>()?;
        crate::trace!("Deserializing property 0x{:02X}", field);
        let field = PropertyIdentifier::try_from(field)
            .map_err(|_| A::Error::custom("Invalid property identifier"))?;

        let property = match field {
            PropertyIdentifier::ResponseTopic => {
                Property::ResponseTopic(variant.newtype_variant()?)
            }
            PropertyIdentifier::PayloadFormatIndicator => {
                Property::PayloadFormatIndicator(variant.newtype_variant()?)
            }
            PropertyIdentifier::MessageExpiryInterval => {
                Property::MessageExpiryInterval(variant.newtype_variant()?)
            }
            PropertyIdentifier::ContentType => Property::ContentType(variant.newtype_variant()?),
            PropertyIdentifier::CorrelationData => {
                let data: BinaryData = variant.newtype_variant()?;
                Property::CorrelationData(data.0.to_vec())
            }
            PropertyIdentifier::SubscriptionIdentifier => {
                let id: Varint = variant.newtype_variant()?;
                Property::SubscriptionIdentifier(id.0)
            }
            PropertyIdentifier::SessionExpiryInterval => {
                Property::SessionExpiryInterval(variant.newtype_variant()?)
            }
            PropertyIdentifier::AssignedClientIdentifier => {
                Property::AssignedClientIdentifier(variant.newtype_variant()?)
            }
            PropertyIdentifier::ServerKeepAlive => {
                Property::ServerKeepAlive(variant.newtype_variant()?)
            }
            PropertyIdentifier::AuthenticationMethod => {
                Property::AuthenticationMethod(variant.newtype_variant()?)
            }
            PropertyIdentifier::AuthenticationData => {
                let data: BinaryData = variant.newtype_variant()?;
                Property::AuthenticationData(data.0.to_vec())
            }
            PropertyIdentifier::RequestProblemInformation => {
                Property::RequestProblemInformation(variant.newtype_variant()?)
            }
            PropertyIdentifier::WillDelayInterval => {
                Property::WillDelayInterval(variant.newtype_variant()?)
            }
            PropertyIdentifier::RequestResponseInformation => {
                Property::RequestResponseInformation(variant.newtype_variant()?)
            }
            PropertyIdentifier::ResponseInformation => {
                Property::ResponseInformation(variant.newtype_variant()?)
            }
            PropertyIdentifier::ServerReference => {
                Property::ServerReference(variant.newtype_variant()?)
            }
            PropertyIdentifier::ReasonString => Property::ReasonString(variant.newtype_variant()?),
            PropertyIdentifier::ReceiveMaximum => {
                Property::ReceiveMaximum(variant.newtype_variant()?)
            }
            PropertyIdentifier::TopicAliasMaximum => {
                Property::TopicAliasMaximum(variant.newtype_variant()?)
            }
            PropertyIdentifier::TopicAlias => Property::TopicAlias(variant.newtype_variant()?),
            PropertyIdentifier::MaximumQoS => Property::MaximumQoS(variant.newtype_variant()?),
            PropertyIdentifier::RetainAvailable => {
                Property::RetainAvailable(variant.newtype_variant()?)
            }
            PropertyIdentifier::UserProperty => {
                let (key, value) = variant.newtype_variant()?;
                Property::UserProperty(key, value)
            }
            PropertyIdentifier::MaximumPacketSize => {
                Property::MaximumPacketSize(variant.newtype_variant()?)
            }
            PropertyIdentifier::WildcardSubscriptionAvailable => {
                Property::WildcardSubscriptionAvailable(variant.newtype_variant()?)
            }
            PropertyIdentifier::SubscriptionIdentifierAvailable => {
                Property::SubscriptionIdentifierAvailable(variant.newtype_variant()?)
            }
            PropertyIdentifier::SharedSubscriptionAvailable => {
                Property::SharedSubscriptionAvailable(variant.newtype_variant()?)
            }
        };

        Ok(property)
    }
}

impl<'de> serde::de::Deserialize<'de> for Property {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_enum("Property", &[], PropertyVisitor)
    }
}

impl serde::Serialize for Property {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut item = serializer.serialize_struct("Property", 0)?;
        item.serialize_field("_identifier", &Varint(self.id() as u32))?;

        match self {
            Property::ContentType(data)
            | Property::ResponseTopic(data)
            | Property::AuthenticationMethod(data)
            | Property::ResponseInformation(data)
            | Property::ServerReference(data)
            | Property::ReasonString(data)
            | Property::AssignedClientIdentifier(data) => {
                item.serialize_field("_data", &Utf8String(data))?;
            }
            Property::UserProperty(key, value) => {
                item.serialize_field("_key", &Utf8String(key))?;
                item.serialize_field("_value", &Utf8String(value))?;
            }
            Property::CorrelationData(data) | Property::AuthenticationData(data) => {
                item.serialize_field("_data", &BinaryData(data))?;
            }
            Property::SubscriptionIdentifier(id) => {
                item.serialize_field("_data", &Varint(*id))?;
            }
            Property::MessageExpiryInterval(value)
            | Property::SessionExpiryInterval(value)
            | Property::WillDelayInterval(value)
            | Property::MaximumPacketSize(value) => {
                item.serialize_field("_data", value)?;
            }
            Property::ServerKeepAlive(value)
            | Property::ReceiveMaximum(value)
            | Property::TopicAliasMaximum(value)
            | Property::TopicAlias(value) => {
                item.serialize_field("_data", value)?;
            }
            Property::PayloadFormatIndicator(value)
            | Property::RequestProblemInformation(value)
            | Property::RequestResponseInformation(value)
            | Property::MaximumQoS(value)
            | Property::RetainAvailable(value)
            | Property::WildcardSubscriptionAvailable(value)
            | Property::SubscriptionIdentifierAvailable(value)
            | Property::SharedSubscriptionAvailable(value) => {
                item.serialize_field("_data", value)?;
            }
        }

        item.end()
    }
}

impl Property {
    pub(crate) fn id(&self) -> PropertyIdentifier {
        match self {
            Property::PayloadFormatIndicator(_) => PropertyIdentifier::PayloadFormatIndicator,
            Property::MessageExpiryInterval(_) => PropertyIdentifier::MessageExpiryInterval,
            Property::ContentType(_) => PropertyIdentifier::ContentType,
            Property::ResponseTopic(_) => PropertyIdentifier::ResponseTopic,
            Property::CorrelationData(_) => PropertyIdentifier::CorrelationData,
            Property::SubscriptionIdentifier(_) => PropertyIdentifier::SubscriptionIdentifier,
            Property::SessionExpiryInterval(_) => PropertyIdentifier::SessionExpiryInterval,
            Property::AssignedClientIdentifier(_) => PropertyIdentifier::AssignedClientIdentifier,
            Property::ServerKeepAlive(_) => PropertyIdentifier::ServerKeepAlive,
            Property::AuthenticationMethod(_) => PropertyIdentifier::AuthenticationMethod,
            Property::AuthenticationData(_) => PropertyIdentifier::AuthenticationData,
            Property::RequestProblemInformation(_) => PropertyIdentifier::RequestProblemInformation,
            Property::WillDelayInterval(_) => PropertyIdentifier::WillDelayInterval,
            Property::RequestResponseInformation(_) => {
                PropertyIdentifier::RequestResponseInformation
            }
            Property::ResponseInformation(_) => PropertyIdentifier::ResponseInformation,
            Property::ServerReference(_) => PropertyIdentifier::ServerReference,
            Property::ReasonString(_) => PropertyIdentifier::ReasonString,
            Property::ReceiveMaximum(_) => PropertyIdentifier::ReceiveMaximum,
            Property::TopicAliasMaximum(_) => PropertyIdentifier::TopicAliasMaximum,
            Property::TopicAlias(_) => PropertyIdentifier::TopicAlias,
            Property::MaximumQoS(_) => PropertyIdentifier::MaximumQoS,
            Property::RetainAvailable(_) => PropertyIdentifier::RetainAvailable,
            Property::UserProperty(_, _) => PropertyIdentifier::UserProperty,
            Property::MaximumPacketSize(_) => PropertyIdentifier::MaximumPacketSize,
            Property::WildcardSubscriptionAvailable(_) => {
                PropertyIdentifier::WildcardSubscriptionAvailable
            }
            Property::SubscriptionIdentifierAvailable(_) => {
                PropertyIdentifier::SubscriptionIdentifierAvailable
            }
            Property::SharedSubscriptionAvailable(_) => {
                PropertyIdentifier::SharedSubscriptionAvailable
            }
        }
    }

    /// The number of bytes the property occupies within a properties block.
    pub(crate) fn size(&self) -> usize {
        let value = match self {
            Property::ContentType(text)
            | Property::ResponseTopic(text)
            | Property::AuthenticationMethod(text)
            | Property::ResponseInformation(text)
            | Property::ServerReference(text)
            | Property::ReasonString(text)
            | Property::AssignedClientIdentifier(text) => 2 + text.len(),
            Property::CorrelationData(data) | Property::AuthenticationData(data) => 2 + data.len(),
            Property::UserProperty(key, value) => 4 + key.len() + value.len(),
            Property::SubscriptionIdentifier(id) => Varint(*id).size(),
            Property::MessageExpiryInterval(_)
            | Property::SessionExpiryInterval(_)
            | Property::WillDelayInterval(_)
            | Property::MaximumPacketSize(_) => 4,
            Property::ServerKeepAlive(_)
            | Property::ReceiveMaximum(_)
            | Property::TopicAliasMaximum(_)
            | Property::TopicAlias(_) => 2,
            Property::PayloadFormatIndicator(_)
            | Property::RequestProblemInformation(_)
            | Property::RequestResponseInformation(_)
            | Property::MaximumQoS(_)
            | Property::RetainAvailable(_)
            | Property::WildcardSubscriptionAvailable(_)
            | Property::SubscriptionIdentifierAvailable(_)
            | Property::SharedSubscriptionAvailable(_) => 1,
        };

        // Every defined identifier fits a single varint byte.
        1 + value
    }

    /// Check if the property may be transmitted in a packet of the provided type.
    pub fn allowed_in(&self, packet: MessageType) -> bool {
        use PropertyIdentifier as Id;

        // User properties may be attached to every packet carrying a properties block.
        if self.id() == Id::UserProperty {
            return !matches!(packet, MessageType::PingReq | MessageType::PingResp);
        }

        match packet {
            MessageType::Connect => matches!(
                self.id(),
                Id::SessionExpiryInterval
                    | Id::ReceiveMaximum
                    | Id::MaximumPacketSize
                    | Id::TopicAliasMaximum
                    | Id::RequestResponseInformation
                    | Id::RequestProblemInformation
                    | Id::AuthenticationMethod
                    | Id::AuthenticationData
            ),
            MessageType::ConnAck => matches!(
                self.id(),
                Id::SessionExpiryInterval
                    | Id::ReceiveMaximum
                    | Id::MaximumQoS
                    | Id::RetainAvailable
                    | Id::MaximumPacketSize
                    | Id::AssignedClientIdentifier
                    | Id::TopicAliasMaximum
                    | Id::ReasonString
                    | Id::WildcardSubscriptionAvailable
                    | Id::SubscriptionIdentifierAvailable
                    | Id::SharedSubscriptionAvailable
                    | Id::ServerKeepAlive
                    | Id::ResponseInformation
                    | Id::ServerReference
                    | Id::AuthenticationMethod
                    | Id::AuthenticationData
            ),
            MessageType::Publish => matches!(
                self.id(),
                Id::PayloadFormatIndicator
                    | Id::MessageExpiryInterval
                    | Id::TopicAlias
                    | Id::ResponseTopic
                    | Id::CorrelationData
                    | Id::SubscriptionIdentifier
                    | Id::ContentType
            ),
            MessageType::PubAck
            | MessageType::PubRec
            | MessageType::PubRel
            | MessageType::PubComp
            | MessageType::SubAck
            | MessageType::UnsubAck => self.id() == Id::ReasonString,
            MessageType::Subscribe => self.id() == Id::SubscriptionIdentifier,
            MessageType::Unsubscribe => false,
            MessageType::Disconnect => matches!(
                self.id(),
                Id::SessionExpiryInterval | Id::ReasonString | Id::ServerReference
            ),
            MessageType::Auth => matches!(
                self.id(),
                Id::AuthenticationMethod | Id::AuthenticationData | Id::ReasonString
            ),
            MessageType::PingReq | MessageType::PingResp => false,
        }
    }

    /// Check if the property may be part of the will properties of a CONNECT.
    pub fn allowed_in_will(&self) -> bool {
        matches!(
            self.id(),
            PropertyIdentifier::WillDelayInterval
                | PropertyIdentifier::PayloadFormatIndicator
                | PropertyIdentifier::MessageExpiryInterval
                | PropertyIdentifier::ContentType
                | PropertyIdentifier::ResponseTopic
                | PropertyIdentifier::CorrelationData
                | PropertyIdentifier::UserProperty
        )
    }
}

/// Read a properties block, rejecting identifiers that are not defined by MQTT v5.
pub(crate) fn read_properties(
    deserializer: &mut MqttDeserializer<'_>,
) -> Result<Vec<Property>, ProtocolError> {
    let length = deserializer.read_varint()? as usize;
    let mut block = MqttDeserializer::new(deserializer.take(length)?);

    let mut properties = Vec::new();
    while let Some(identifier) = block.peek() {
        if PropertyIdentifier::try_from(identifier).is_err() {
            crate::warn!("Unknown property identifier 0x{:02X}", identifier);
            return Err(ProtocolError::UnknownProperty);
        }

        properties.push(Property::deserialize(&mut block)?);
    }

    Ok(properties)
}

/// Verify every property of a decoded properties block may appear in the given packet.
pub(crate) fn validate(properties: &[Property], packet: MessageType) -> Result<(), ProtocolError> {
    match properties.iter().find(|prop| !prop.allowed_in(packet)) {
        Some(prop) => {
            crate::warn!("{:?} is not allowed in {:?}", prop.id(), packet);
            Err(ProtocolError::PropertyNotAllowed)
        }
        None => Ok(()),
    }
}

/// Convenience accessors over an ordered properties list.
pub trait PropertiesExt {
    fn session_expiry_interval(&self) -> Option<u32>;
    fn receive_maximum(&self) -> Option<u16>;
    fn maximum_packet_size(&self) -> Option<u32>;
    fn reason_string(&self) -> Option<&str>;
    fn user_properties(&self) -> Vec<(&str, &str)>;
    fn subscription_identifiers(&self) -> Vec<u32>;
    fn message_expiry_interval(&self) -> Option<u32>;
    fn server_keep_alive(&self) -> Option<u16>;
    fn assigned_client_identifier(&self) -> Option<&str>;
    fn maximum_qos(&self) -> Option<u8>;
    fn retain_available(&self) -> Option<bool>;
    fn authentication_method(&self) -> Option<&str>;
    fn authentication_data(&self) -> Option<&[u8]>;
    fn topic_alias(&self) -> Option<u16>;
}

impl PropertiesExt for [Property] {
    fn session_expiry_interval(&self) -> Option<u32> {
        self.iter().find_map(|prop| match prop {
            Property::SessionExpiryInterval(interval) => Some(*interval),
            _ => None,
        })
    }

    fn receive_maximum(&self) -> Option<u16> {
        self.iter().find_map(|prop| match prop {
            Property::ReceiveMaximum(max) => Some(*max),
            _ => None,
        })
    }

    fn maximum_packet_size(&self) -> Option<u32> {
        self.iter().find_map(|prop| match prop {
            Property::MaximumPacketSize(size) => Some(*size),
            _ => None,
        })
    }

    fn reason_string(&self) -> Option<&str> {
        self.iter().find_map(|prop| match prop {
            Property::ReasonString(reason) => Some(reason.as_str()),
            _ => None,
        })
    }

    fn user_properties(&self) -> Vec<(&str, &str)> {
        self.iter()
            .filter_map(|prop| match prop {
                Property::UserProperty(key, value) => Some((key.as_str(), value.as_str())),
                _ => None,
            })
            .collect()
    }

    fn subscription_identifiers(&self) -> Vec<u32> {
        self.iter()
            .filter_map(|prop| match prop {
                Property::SubscriptionIdentifier(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn message_expiry_interval(&self) -> Option<u32> {
        self.iter().find_map(|prop| match prop {
            Property::MessageExpiryInterval(interval) => Some(*interval),
            _ => None,
        })
    }

    fn server_keep_alive(&self) -> Option<u16> {
        self.iter().find_map(|prop| match prop {
            Property::ServerKeepAlive(keep_alive) => Some(*keep_alive),
            _ => None,
        })
    }

    fn assigned_client_identifier(&self) -> Option<&str> {
        self.iter().find_map(|prop| match prop {
            Property::AssignedClientIdentifier(id) => Some(id.as_str()),
            _ => None,
        })
    }

    fn maximum_qos(&self) -> Option<u8> {
        self.iter().find_map(|prop| match prop {
            Property::MaximumQoS(qos) => Some(*qos),
            _ => None,
        })
    }

    fn retain_available(&self) -> Option<bool> {
        self.iter().find_map(|prop| match prop {
            Property::RetainAvailable(available) => Some(*available != 0),
            _ => None,
        })
    }

    fn authentication_method(&self) -> Option<&str> {
        self.iter().find_map(|prop| match prop {
            Property::AuthenticationMethod(method) => Some(method.as_str()),
            _ => None,
        })
    }

    fn authentication_data(&self) -> Option<&[u8]> {
        self.iter().find_map(|prop| match prop {
            Property::AuthenticationData(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    fn topic_alias(&self) -> Option<u16> {
        self.iter().find_map(|prop| match prop {
            Property::TopicAlias(alias) => Some(*alias),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ser::MqttSerializer, types::Properties};
    use serde::Serialize;

    #[test]
    fn serialize_user_property() {
        let mut serializer = MqttSerializer::new();
        Properties(&[Property::UserProperty("a".into(), "bc".into())])
            .serialize(&mut serializer)
            .unwrap();

        #[rustfmt::skip]
        let good = [
            0x08, // Properties length
            0x26, // UserProperty identifier
            0x00, 0x01, b'a',
            0x00, 0x02, b'b', b'c',
        ];
        assert_eq!(serializer.into_body(), good);
    }

    #[test]
    fn deserialize_properties() {
        #[rustfmt::skip]
        let serialized = [
            0x0B, // Properties length
            0x11, 0x00, 0x00, 0x00, 0x3C, // SessionExpiryInterval(60)
            0x0B, 0x81, 0x01, // SubscriptionIdentifier(129)
            0x09, 0x00, 0x01, 0xAA, // CorrelationData
        ];

        let mut deserializer = MqttDeserializer::new(&serialized);
        let properties = Vec::<Property>::deserialize(&mut deserializer).unwrap();
        assert_eq!(
            properties,
            vec![
                Property::SessionExpiryInterval(60),
                Property::SubscriptionIdentifier(129),
                Property::CorrelationData(vec![0xAA]),
            ]
        );
        assert!(deserializer.is_empty());
    }

    #[test]
    fn user_properties_preserve_duplicates() {
        let props = vec![
            Property::UserProperty("k".into(), "1".into()),
            Property::ReasonString("why".into()),
            Property::UserProperty("k".into(), "2".into()),
        ];

        let mut serializer = MqttSerializer::new();
        Properties(&props).serialize(&mut serializer).unwrap();
        let bytes = serializer.into_body();

        let decoded = Vec::<Property>::deserialize(&mut MqttDeserializer::new(&bytes)).unwrap();
        assert_eq!(decoded.user_properties(), vec![("k", "1"), ("k", "2")]);
        assert_eq!(decoded.reason_string(), Some("why"));
    }

    #[test]
    fn unknown_identifier_rejected() {
        let serialized = [0x02, 0x7F, 0x00];
        let mut deserializer = MqttDeserializer::new(&serialized);
        assert_eq!(
            read_properties(&mut deserializer),
            Err(ProtocolError::UnknownProperty)
        );
    }

    #[test]
    fn allowed_sets() {
        assert!(Property::SessionExpiryInterval(1).allowed_in(MessageType::Connect));
        assert!(!Property::TopicAlias(1).allowed_in(MessageType::Connect));
        assert!(Property::ReasonString("x".into()).allowed_in(MessageType::PubAck));
        assert!(Property::UserProperty("a".into(), "b".into()).allowed_in(MessageType::Unsubscribe));
        assert!(!Property::SubscriptionIdentifier(1).allowed_in(MessageType::Unsubscribe));
        assert!(Property::WillDelayInterval(5).allowed_in_will());
        assert!(!Property::WillDelayInterval(5).allowed_in(MessageType::Publish));
        assert_eq!(
            validate(&[Property::MaximumQoS(1)], MessageType::Publish),
            Err(ProtocolError::PropertyNotAllowed)
        );
    }
}
