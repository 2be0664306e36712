//! The serde [Deserializer](serde::Deserializer) reading MQTT wire primitives.
//!
//! # Design
//! The data model maps onto the MQTT encodings as follows:
//!
//! * Integers are big-endian and of fixed width. Booleans are a byte holding 0 or 1.
//! * Strings and byte slices carry a 16-bit length prefix and are borrowed from the input.
//!   Strings must be valid UTF-8.
//! * An option is `Some` while input remains and `None` at the end of the input.
//! * A sequence is a properties block. It is prefixed with its size in bytes as a variable byte
//!   integer, so the element count is only known once the block was consumed.
//! * Tuples and structs read exactly as many elements as they have fields.
//! * Enum variants are selected by a variable byte integer.
//!
//! Other data types are rejected.
use serde::de::{self, DeserializeSeed, IntoDeserializer, Visitor};
use varint_rs::VarintReader;

use crate::varint::{MAX_VARINT, MAX_VARINT_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The input ended in the middle of a value.
    Truncated,

    /// A string was not valid UTF-8.
    InvalidUtf8,

    /// A boolean byte was neither 0 nor 1.
    InvalidBool,

    /// A variable byte integer used more than four bytes or exceeded its maximum value.
    MalformedInteger,

    /// The serde data type has no MQTT representation.
    Unsupported(&'static str),

    /// A [Deserialize](serde::Deserialize) implementation rejected the value.
    Message(String),
}

impl de::StdError for Error {}

impl de::Error for Error {
    fn custom<T: core::fmt::Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Truncated => write!(f, "packet ends early"),
            Error::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Error::InvalidBool => write!(f, "boolean is neither 0 nor 1"),
            Error::MalformedInteger => write!(f, "malformed variable byte integer"),
            Error::Unsupported(method) => write!(f, "`{}` has no MQTT encoding", method),
            Error::Message(msg) => write!(f, "{}", msg),
        }
    }
}

/// A cursor over a received packet body.
pub struct MqttDeserializer<'a> {
    buf: &'a [u8],
    index: usize,
}

impl<'a> MqttDeserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, index: 0 }
    }

    /// Consume the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let data = self
            .buf
            .get(self.index..self.index + n)
            .ok_or(Error::Truncated)?;
        self.index += n;
        Ok(data)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    /// The next byte, without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.index).copied()
    }

    /// The number of bytes not consumed yet.
    pub fn len(&self) -> usize {
        self.buf.len() - self.index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a variable byte integer of at most four bytes.
    pub fn read_varint(&mut self) -> Result<u32, Error> {
        let value = BoundedVarintReader {
            input: self,
            count: 0,
        }
        .read_u32_varint()?;

        if value > MAX_VARINT {
            return Err(Error::MalformedInteger);
        }
        Ok(value)
    }

    /// Consume everything that is left, e.g. a PUBLISH payload.
    pub fn remainder(&mut self) -> &'a [u8] {
        let data = &self.buf[self.index..];
        self.index = self.buf.len();
        data
    }

    fn length_prefixed(&mut self) -> Result<&'a [u8], Error> {
        let length = u16::from_be_bytes(self.take_array()?);
        self.take(length as usize)
    }
}

struct BoundedVarintReader<'a, 'de> {
    input: &'a mut MqttDeserializer<'de>,
    count: usize,
}

impl VarintReader for BoundedVarintReader<'_, '_> {
    type Error = Error;

    fn read(&mut self) -> Result<u8, Error> {
        if self.count == MAX_VARINT_SIZE {
            return Err(Error::MalformedInteger);
        }
        self.count += 1;
        Ok(self.input.take_array::<1>()?[0])
    }
}

/// Deserializer methods for data types MQTT cannot carry.
macro_rules! unsupported {
    ($($method:ident($($arg:ty),*);)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, $(_: $arg,)* _visitor: V) -> Result<V::Value, Error> {
                Err(Error::Unsupported(stringify!($method)))
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for &mut MqttDeserializer<'de> {
    type Error = Error;

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.take_array::<1>()? {
            [0] => visitor.visit_bool(false),
            [1] => visitor.visit_bool(true),
            _ => Err(Error::InvalidBool),
        }
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_i8(i8::from_be_bytes(self.take_array()?))
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_i16(i16::from_be_bytes(self.take_array()?))
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_i32(i32::from_be_bytes(self.take_array()?))
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_u8(self.take_array::<1>()?[0])
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_u16(u16::from_be_bytes(self.take_array()?))
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_u32(u32::from_be_bytes(self.take_array()?))
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        let string = core::str::from_utf8(self.length_prefixed()?).map_err(|_| Error::InvalidUtf8)?;
        visitor.visit_borrowed_str(string)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_borrowed_bytes(self.length_prefixed()?)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        if self.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        let remaining = self.read_varint()? as usize;
        if remaining > self.len() {
            return Err(Error::Truncated);
        }

        visitor.visit_seq(SizedBlock {
            input: self,
            remaining,
        })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_seq(Elements {
            input: self,
            remaining: len,
        })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_tuple(fields.len(), visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_enum(self)
    }

    unsupported! {
        deserialize_any();
        deserialize_i64();
        deserialize_u64();
        deserialize_f32();
        deserialize_f64();
        deserialize_char();
        deserialize_unit();
        deserialize_map();
        deserialize_identifier();
        deserialize_ignored_any();
        deserialize_unit_struct(&'static str);
        deserialize_newtype_struct(&'static str);
    }
}

/// Exactly `remaining` elements, e.g. the fields of a struct.
struct Elements<'a, 'de> {
    input: &'a mut MqttDeserializer<'de>,
    remaining: usize,
}

impl<'de> de::SeqAccess<'de> for Elements<'_, 'de> {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }

        self.remaining -= 1;
        seed.deserialize(&mut *self.input).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// Elements spanning exactly `remaining` bytes.
struct SizedBlock<'a, 'de> {
    input: &'a mut MqttDeserializer<'de>,
    remaining: usize,
}

impl<'de> de::SeqAccess<'de> for SizedBlock<'_, 'de> {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let before = self.input.len();
        let element = seed.deserialize(&mut *self.input)?;
        let consumed = before - self.input.len();

        // An element must not run past the end of the block.
        self.remaining = self
            .remaining
            .checked_sub(consumed)
            .ok_or(Error::Truncated)?;
        Ok(Some(element))
    }
}

impl<'de> de::VariantAccess<'de> for &mut MqttDeserializer<'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<(), Error> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, Error> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, Error> {
        de::Deserializer::deserialize_tuple(self, len, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        de::Deserializer::deserialize_tuple(self, fields.len(), visitor)
    }
}

impl<'de> de::EnumAccess<'de> for &mut MqttDeserializer<'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<(T::Value, Self), Error> {
        let discriminant: de::value::U32Deserializer<Error> =
            self.read_varint()?.into_deserializer();
        Ok((seed.deserialize(discriminant)?, self))
    }
}
