use crate::{message_types::MessageType, varint::MAX_VARINT_SIZE, ProtocolError};
use bit_field::BitField;
use bytes::{Buf, Bytes, BytesMut};
use core::convert::TryFrom;

/// The decoded first bytes of every MQTT control packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedHeader {
    pub message_type: MessageType,
    pub flags: u8,
    pub remaining_length: usize,
}

impl FixedHeader {
    /// Interpret the type/flags byte of a packet.
    ///
    /// # Note
    /// Flags are verified for every packet type other than PUBLISH, whose flags carry QoS,
    /// retain and duplicate information.
    pub fn new(header: u8, remaining_length: usize) -> Result<Self, ProtocolError> {
        let message_type = MessageType::try_from(header.get_bits(4..=7))
            .map_err(|_| ProtocolError::MalformedPacket)?;
        let flags = header.get_bits(0..=3);

        if let Some(required) = message_type.required_flags() {
            if flags != required {
                return Err(ProtocolError::InvalidFixedHeaderFlags);
            }
        }

        Ok(Self {
            message_type,
            flags,
            remaining_length,
        })
    }
}

/// Parse a remaining length from the front of `int`.
///
/// Returns `None` if more data is required and the value along with its encoded size otherwise.
fn parse_variable_byte_integer(int: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut acc = 0;
    for (i, byte) in int.iter().enumerate() {
        if i == MAX_VARINT_SIZE {
            return Err(ProtocolError::RemainingLengthInvalid);
        }

        acc += ((byte & 0b0111_1111) as usize) << (i * 7);
        if byte & 0b1000_0000 == 0 {
            return Ok(Some((acc, i + 1)));
        }
    }

    Ok(None)
}

/// Accumulates bytes from a stream and splits them into complete control packets.
pub struct PacketReader {
    buffer: BytesMut,
    maximum_packet_size: usize,
}

impl PacketReader {
    pub fn new(maximum_packet_size: usize) -> PacketReader {
        PacketReader {
            buffer: BytesMut::with_capacity(1024),
            maximum_packet_size,
        }
    }

    /// Update the largest packet accepted by the reader.
    pub fn set_maximum_packet_size(&mut self, size: usize) {
        self.maximum_packet_size = size;
    }

    /// Append received stream data to the reader.
    pub fn fill(&mut self, stream: &[u8]) {
        self.buffer.extend_from_slice(stream);
    }

    /// The number of buffered bytes that have not yet formed a packet.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Inspect the buffered data for a fixed header.
    ///
    /// # Returns
    /// The header and its encoded size once the remaining length has been completely received.
    pub fn probe_fixed_header(&self) -> Result<Option<(FixedHeader, usize)>, ProtocolError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let (remaining_length, nbytes) = match parse_variable_byte_integer(&self.buffer[1..])? {
            Some(length) => length,
            None => return Ok(None),
        };

        let header = FixedHeader::new(self.buffer[0], remaining_length)?;
        if 1 + nbytes + remaining_length > self.maximum_packet_size {
            return Err(ProtocolError::PacketTooLarge);
        }

        Ok(Some((header, 1 + nbytes)))
    }

    /// Remove the next complete packet from the buffer.
    pub fn pop_packet(&mut self) -> Result<Option<(FixedHeader, Bytes)>, ProtocolError> {
        let (header, header_length) = match self.probe_fixed_header()? {
            Some(probe) => probe,
            None => return Ok(None),
        };

        if self.buffer.len() < header_length + header.remaining_length {
            return Ok(None);
        }

        self.buffer.advance(header_length);
        let body = self.buffer.split_to(header.remaining_length).freeze();
        Ok(Some((header, body)))
    }
}
