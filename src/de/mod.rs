//! Deserialization of MQTT primitives and framing of received packets.
mod deserializer;
pub(crate) mod packet_reader;

pub use deserializer::{Error, MqttDeserializer};
pub use packet_reader::{FixedHeader, PacketReader};
