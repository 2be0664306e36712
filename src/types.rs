use crate::{properties::Property, varint::Varint, ProtocolError, QoS};
use bit_field::BitField;
use core::convert::TryFrom;
use num_enum::TryFromPrimitive;
use serde::ser::SerializeStruct;

/// A properties block: a variable byte integer length followed by the encoded properties.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Properties<'a>(pub &'a [Property]);

impl<'a> Properties<'a> {
    /// The encoded size of the properties, excluding the length prefix.
    pub fn size(&self) -> usize {
        self.0.iter().map(Property::size).sum()
    }
}

impl<'a> serde::Serialize for Properties<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut item = serializer.serialize_struct("Properties", 0)?;
        item.serialize_field("_len", &Varint(self.size() as u32))?;
        item.serialize_field("_props", self.0)?;
        item.end()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BinaryData<'a>(pub &'a [u8]);

impl<'a> serde::Serialize for BinaryData<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let len = u16::try_from(self.0.len())
            .map_err(|_| S::Error::custom("Binary data exceeds 65535 bytes"))?;
        let mut item = serializer.serialize_struct("_BinaryData", 0)?;
        item.serialize_field("_len", &len)?;
        item.serialize_field("_data", &RawBytes(self.0))?;
        item.end()
    }
}

struct BinaryDataVisitor;

impl<'de> serde::de::Visitor<'de> for BinaryDataVisitor {
    type Value = BinaryData<'de>;

    fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(formatter, "BinaryData")
    }

    fn visit_borrowed_bytes<E: serde::de::Error>(self, data: &'de [u8]) -> Result<Self::Value, E> {
        Ok(BinaryData(data))
    }
}

impl<'de> serde::de::Deserialize<'de> for BinaryData<'de> {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BinaryDataVisitor)
    }
}

/// Bytes written verbatim, without any length prefix.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RawBytes<'a>(pub &'a [u8]);

impl<'a> serde::Serialize for RawBytes<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Utf8String<'a>(pub &'a str);

impl<'a> serde::Serialize for Utf8String<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        let len = u16::try_from(self.0.len())
            .map_err(|_| S::Error::custom("String exceeds 65535 bytes"))?;
        let mut item = serializer.serialize_struct("_Utf8String", 0)?;
        item.serialize_field("_len", &len)?;
        item.serialize_field("_string", self.0)?;
        item.end()
    }
}

/// How retained messages are sent when a subscription is established.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at the time of the subscribe.
    SendAtSubscribe = 0,

    /// Send retained messages only if the subscription does not currently exist.
    SendAtSubscribeIfNew = 1,

    /// Do not send retained messages.
    DoNotSend = 2,
}

/// Options associated with a single topic filter of a SUBSCRIBE request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new(QoS::AtMostOnce)
    }
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
        }
    }

    /// Do not forward messages published by this client back to it.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Keep the retain flag of forwarded messages as it was published.
    pub fn retain_as_published(mut self) -> Self {
        self.retain_as_published = true;
        self
    }

    pub fn retain_handling(mut self, handling: RetainHandling) -> Self {
        self.retain_handling = handling;
        self
    }

    /// The MQTT v5 subscription options byte.
    pub fn as_byte(&self) -> u8 {
        *0u8.set_bits(0..=1, self.qos as u8)
            .set_bit(2, self.no_local)
            .set_bit(3, self.retain_as_published)
            .set_bits(4..=5, self.retain_handling as u8)
    }

    /// Parse a subscription options byte. Only the QoS bits are meaningful before MQTT v5.
    pub fn from_byte(byte: u8, extended: bool) -> Result<Self, ProtocolError> {
        if byte.get_bits(6..=7) != 0 || (!extended && byte.get_bits(2..=7) != 0) {
            return Err(ProtocolError::MalformedPacket);
        }

        let qos = QoS::try_from(byte.get_bits(0..=1)).map_err(|_| ProtocolError::InvalidQoS)?;
        let retain_handling = RetainHandling::try_from(byte.get_bits(4..=5))
            .map_err(|_| ProtocolError::MalformedPacket)?;

        Ok(Self {
            qos,
            no_local: byte.get_bit(2),
            retain_as_published: byte.get_bit(3),
            retain_handling,
        })
    }
}

/// A single entry of a SUBSCRIBE request.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicSubscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl TopicSubscription {
    pub fn new(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_options_bits() {
        let options = SubscriptionOptions::new(QoS::ExactlyOnce)
            .no_local()
            .retain_as_published()
            .retain_handling(RetainHandling::DoNotSend);
        assert_eq!(options.as_byte(), 0b0010_1110);
        assert_eq!(SubscriptionOptions::from_byte(0b0010_1110, true).unwrap(), options);
    }

    #[test]
    fn legacy_options_reject_extended_bits() {
        assert_eq!(
            SubscriptionOptions::from_byte(0b0000_0101, false),
            Err(ProtocolError::MalformedPacket)
        );
        assert_eq!(
            SubscriptionOptions::from_byte(0b0000_0001, false).unwrap().qos,
            QoS::AtLeastOnce
        );
    }

    #[test]
    fn invalid_qos_rejected() {
        assert_eq!(
            SubscriptionOptions::from_byte(0b0000_0011, true),
            Err(ProtocolError::InvalidQoS)
        );
    }
}
