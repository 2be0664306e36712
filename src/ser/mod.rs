//! Serialization of MQTT primitives into packet buffers.
mod serializer;

pub use serializer::{Error, MqttSerializer};
