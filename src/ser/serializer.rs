//! The serde [Serializer](serde::Serializer) writing MQTT wire primitives.
//!
//! # Design
//! Values are written linearly into a growable packet buffer. Integers are big-endian and of
//! fixed width, strings and byte slices are written raw, `None` is written as nothing and
//! sequences, tuples and structs are the concatenation of their elements.
//!
//! Room for the fixed header is kept at the front of the buffer. [MqttSerializer::finalize]
//! fills it in once the size of the packet is known, so a packet is never copied to prepend it.
//!
//! Length prefixes are not written here. The wrappers in [crate::types] and the property and
//! variable-integer types add them where MQTT requires one.
use crate::message_types::MessageType;
use crate::varint::{VarintBuffer, MAX_VARINT};
use bit_field::BitField;
use serde::ser::{self, Serialize};
use varint_rs::VarintWriter;

/// The header byte followed by the longest remaining-length encoding.
const HEADER_ROOM: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The packet body exceeds the largest remaining length MQTT can express.
    PacketTooLarge,

    /// The serde data type has no MQTT representation.
    Unsupported(&'static str),

    /// A [Serialize] implementation reported an error.
    Message(String),
}

impl ser::StdError for Error {}

impl ser::Error for Error {
    fn custom<T: core::fmt::Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::PacketTooLarge => write!(f, "packet exceeds the maximum remaining length"),
            Error::Unsupported(method) => write!(f, "`{}` has no MQTT encoding", method),
            Error::Message(msg) => write!(f, "{}", msg),
        }
    }
}

/// A packet under construction.
pub struct MqttSerializer {
    buf: Vec<u8>,
}

impl Default for MqttSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttSerializer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; HEADER_ROOM],
        }
    }

    /// The number of body bytes written so far.
    pub fn body_len(&self) -> usize {
        self.buf.len() - HEADER_ROOM
    }

    /// Take the bytes written so far, without any fixed header.
    pub fn into_body(mut self) -> Vec<u8> {
        self.buf.drain(..HEADER_ROOM);
        self.buf
    }

    /// Complete the packet by writing its fixed header in front of the body.
    ///
    /// # Args
    /// * `typ` - The control packet type.
    /// * `flags` - The low nibble of the header byte.
    pub fn finalize(mut self, typ: MessageType, flags: u8) -> Result<Vec<u8>, Error> {
        let remaining = u32::try_from(self.body_len())
            .ok()
            .filter(|length| *length <= MAX_VARINT)
            .ok_or(Error::PacketTooLarge)?;

        let mut length = VarintBuffer::new();
        length
            .write_u32_varint(remaining)
            .map_err(|_| Error::PacketTooLarge)?;

        let start = HEADER_ROOM - length.data.len() - 1;
        self.buf[start] = *0u8.set_bits(4..8, typ as u8).set_bits(0..4, flags);
        self.buf[start + 1..HEADER_ROOM].copy_from_slice(&length.data);

        self.buf.drain(..start);
        Ok(self.buf)
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn push(&mut self, byte: u8) -> Result<(), Error> {
        self.buf.push(byte);
        Ok(())
    }
}

/// Serializer methods for data types MQTT cannot carry.
macro_rules! unsupported {
    ($($method:ident($($arg:ty),*) -> $ret:ty;)*) => {
        $(
            fn $method(self, $(_: $arg),*) -> Result<$ret, Error> {
                Err(Error::Unsupported(stringify!($method)))
            }
        )*
    };
}

impl ser::Serializer for &mut MqttSerializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = ser::Impossible<(), Error>;
    type SerializeStruct = Self;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<(), Error> {
        self.push(v as u8)
    }

    fn serialize_i8(self, v: i8) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_i16(self, v: i16) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_i32(self, v: i32) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_i64(self, v: i64) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u8(self, v: u8) -> Result<(), Error> {
        self.push(v)
    }

    fn serialize_u16(self, v: u16) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u32(self, v: u32) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_u64(self, v: u64) -> Result<(), Error> {
        self.push_bytes(&v.to_be_bytes())
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.push_bytes(v.as_bytes())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), Error> {
        self.push_bytes(v)
    }

    fn serialize_none(self) -> Result<(), Error> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, Error> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, Error> {
        Ok(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("serialize_newtype_variant"))
    }

    fn collect_str<T: ?Sized + core::fmt::Display>(self, _value: &T) -> Result<(), Error> {
        Err(Error::Unsupported("collect_str"))
    }

    unsupported! {
        serialize_f32(f32) -> ();
        serialize_f64(f64) -> ();
        serialize_char(char) -> ();
        serialize_unit() -> ();
        serialize_unit_variant(&'static str, u32, &'static str) -> ();
        serialize_tuple_struct(&'static str, usize) -> Self::SerializeTupleStruct;
        serialize_tuple_variant(&'static str, u32, &'static str, usize)
            -> Self::SerializeTupleVariant;
        serialize_map(Option<usize>) -> Self::SerializeMap;
        serialize_struct_variant(&'static str, u32, &'static str, usize)
            -> Self::SerializeStructVariant;
    }
}

impl ser::SerializeStruct for &mut MqttSerializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeSeq for &mut MqttSerializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut MqttSerializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_header_is_prepended() {
        let mut serializer = MqttSerializer::new();
        serializer.push_bytes(&[0xAB; 200]).unwrap();
        let packet = serializer.finalize(MessageType::Publish, 0b0011).unwrap();

        // 200 needs a two byte remaining length.
        assert_eq!(&packet[..3], &[0x33, 0xC8, 0x01]);
        assert_eq!(packet.len(), 203);
    }

    #[test]
    fn empty_body() {
        let packet = MqttSerializer::new()
            .finalize(MessageType::PingReq, 0)
            .unwrap();
        assert_eq!(packet, vec![0xC0, 0x00]);
    }

    #[test]
    fn unsupported_types_rejected() {
        let mut serializer = MqttSerializer::new();
        assert_eq!(
            1.5f32.serialize(&mut serializer),
            Err(Error::Unsupported("serialize_f32"))
        );
        assert_eq!(serializer.body_len(), 0);
    }
}
