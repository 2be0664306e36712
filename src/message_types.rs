use num_enum::TryFromPrimitive;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl MessageType {
    /// The fixed header flags every packet of this type must carry. Publish flags are variable.
    pub fn required_flags(&self) -> Option<u8> {
        match self {
            MessageType::Publish => None,
            MessageType::PubRel | MessageType::Subscribe | MessageType::Unsubscribe => {
                Some(0b0010)
            }
            _ => Some(0b0000),
        }
    }

    /// True for packet types that only exist in MQTT v5.
    pub fn is_v5_only(&self) -> bool {
        matches!(self, MessageType::Auth)
    }
}
