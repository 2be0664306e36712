use core::marker::PhantomData;
use serde::ser::SerializeTuple;
use varint_rs::{VarintReader, VarintWriter};

/// The largest value representable by an MQTT variable byte integer.
pub const MAX_VARINT: u32 = 268_435_455;

/// The longest encoding of an MQTT variable byte integer.
pub const MAX_VARINT_SIZE: usize = 4;

/// A value encoded as an MQTT variable byte integer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Varint(pub u32);

impl From<u32> for Varint {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Varint {
    /// The number of bytes the value occupies on the wire.
    pub fn size(&self) -> usize {
        match self.0 {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }
}

/// Scratch space used to encode a single variable byte integer.
#[derive(Default)]
pub struct VarintBuffer {
    pub data: heapless::Vec<u8, MAX_VARINT_SIZE>,
}

impl VarintBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VarintWriter for VarintBuffer {
    type Error = u8;

    /// Fails with the rejected byte once four bytes were written.
    fn write(&mut self, byte: u8) -> Result<(), u8> {
        self.data.push(byte)
    }
}

impl serde::Serialize for Varint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut encoded = VarintBuffer::new();
        if self.0 > MAX_VARINT || encoded.write_u32_varint(self.0).is_err() {
            return Err(serde::ser::Error::custom(format_args!(
                "{} exceeds the variable byte integer range",
                self.0
            )));
        }

        let mut bytes = serializer.serialize_tuple(encoded.data.len())?;
        encoded
            .data
            .iter()
            .try_for_each(|byte| bytes.serialize_element(byte))?;
        bytes.end()
    }
}

/// Feeds the elements of a serde sequence to the varint decoder one byte at a time.
struct ByteSeq<'de, A>(A, PhantomData<&'de ()>);

impl<'de, A: serde::de::SeqAccess<'de>> VarintReader for ByteSeq<'de, A> {
    type Error = A::Error;

    fn read(&mut self) -> Result<u8, A::Error> {
        self.0
            .next_element()?
            .ok_or_else(|| serde::de::Error::custom("variable byte integer is too long"))
    }
}

impl<'de> serde::de::Deserialize<'de> for Varint {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Varint, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Varint;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a variable byte integer")
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, seq: A) -> Result<Varint, A::Error> {
                ByteSeq(seq, PhantomData).read_u32_varint().map(Varint)
            }
        }

        deserializer.deserialize_tuple(MAX_VARINT_SIZE, Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::de::MqttDeserializer;
    use serde::Deserialize;

    fn encode(value: u32) -> heapless::Vec<u8, MAX_VARINT_SIZE> {
        let mut buffer = VarintBuffer::new();
        buffer.write_u32_varint(value).unwrap();
        buffer.data
    }

    #[test]
    fn boundary_encodings() {
        assert_eq!(&encode(0)[..], &[0x00]);
        assert_eq!(&encode(127)[..], &[0x7F]);
        assert_eq!(&encode(128)[..], &[0x80, 0x01]);
        assert_eq!(&encode(16_383)[..], &[0xFF, 0x7F]);
        assert_eq!(&encode(16_384)[..], &[0x80, 0x80, 0x01]);
        assert_eq!(&encode(2_097_151)[..], &[0xFF, 0xFF, 0x7F]);
        assert_eq!(&encode(2_097_152)[..], &[0x80, 0x80, 0x80, 0x01]);
        assert_eq!(&encode(MAX_VARINT)[..], &[0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn boundary_decodings() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_VARINT] {
            let bytes = encode(value);
            let mut deserializer = MqttDeserializer::new(&bytes);
            assert_eq!(Varint::deserialize(&mut deserializer).unwrap(), Varint(value));
            assert_eq!(Varint(value).size(), bytes.len());
        }
    }

    #[test]
    fn overlong_encoding_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut deserializer = MqttDeserializer::new(&bytes);
        assert!(Varint::deserialize(&mut deserializer).is_err());
    }

    #[test]
    fn out_of_range_not_encoded() {
        let mut serializer = crate::ser::MqttSerializer::new();
        assert!(serde::Serialize::serialize(&Varint(MAX_VARINT + 1), &mut serializer).is_err());
    }
}
