use num_enum::{FromPrimitive, IntoPrimitive};

/// MQTTv5-defined codes that may be returned in response to control packets.
///
/// Legacy protocol revisions use a subset of these values. CONNACK return codes of MQTT 3.1 and
/// 3.1.1 are translated with [ReasonCode::from_connack_return_code] and
/// [ReasonCode::to_connack_return_code].
#[derive(PartialEq, Eq, PartialOrd, Copy, Clone, Debug, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReasonCode {
    Success = 0x00,
    GrantedQos1 = 0x01,
    GrantedQos2 = 0x02,
    DisconnectWithWill = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,

    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationError = 0x83,
    UnsupportedProtocol = 0x84,
    ClientIdentifierInvalid = 0x85,
    BadUsernameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8a,
    ServerShuttingDown = 0x8b,
    BadAuthMethod = 0x8c,
    KeepAliveTimeout = 0x8d,
    SessionTakenOver = 0x8e,
    TopicFilterInvalid = 0x8f,
    TopicNameInvalid = 0x90,
    PacketIdInUse = 0x91,
    PacketIdNotFound = 0x92,
    ReceiveMaxExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QosNotSupported = 0x9b,
    UseAnotherServer = 0x9c,
    ServerMoved = 0x9d,
    SharedSubscriptionsNotSupported = 0x9e,
    ConnectionRateExceeded = 0x9f,
    MaximumConnectTime = 0xa0,
    SubscriptionIdentifiersNotSupported = 0xa1,
    WildcardSubscriptionsNotSupported = 0xa2,

    /// The reason code is not one of the documented MQTT reason codes.
    #[num_enum(default)]
    Unknown = 0xFF,
}

impl serde::Serialize for ReasonCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*self))
    }
}

impl<'de> serde::de::Deserialize<'de> for ReasonCode {
    fn deserialize<D: serde::de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Every byte is accepted. Undocumented values become `Unknown`.
        <u8 as serde::Deserialize>::deserialize(deserializer).map(ReasonCode::from)
    }
}

impl From<&ReasonCode> for u8 {
    fn from(code: &ReasonCode) -> u8 {
        u8::from(*code)
    }
}

impl From<crate::QoS> for ReasonCode {
    fn from(qos: crate::QoS) -> ReasonCode {
        match qos {
            crate::QoS::AtMostOnce => ReasonCode::Success,
            crate::QoS::AtLeastOnce => ReasonCode::GrantedQos1,
            crate::QoS::ExactlyOnce => ReasonCode::GrantedQos2,
        }
    }
}

impl From<ReasonCode> for Result<(), ReasonCode> {
    fn from(code: ReasonCode) -> Result<(), ReasonCode> {
        if code.success() {
            Ok(())
        } else {
            Err(code)
        }
    }
}

impl ReasonCode {
    /// Convert the code into a result, failing with [crate::Error::Failed] for error codes.
    pub fn as_result(&self) -> Result<(), crate::Error> {
        let result: Result<(), ReasonCode> = (*self).into();
        result?;
        Ok(())
    }

    /// Codes below 0x80 report success.
    pub fn success(&self) -> bool {
        u8::from(*self) < 0x80
    }

    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Translate an MQTT 3.x CONNACK return code.
    pub fn from_connack_return_code(code: u8) -> ReasonCode {
        match code {
            0 => ReasonCode::Success,
            1 => ReasonCode::UnsupportedProtocol,
            2 => ReasonCode::ClientIdentifierInvalid,
            3 => ReasonCode::ServerUnavailable,
            4 => ReasonCode::BadUsernameOrPassword,
            5 => ReasonCode::NotAuthorized,
            _ => ReasonCode::Unknown,
        }
    }

    /// The closest MQTT 3.x CONNACK return code for this reason.
    pub fn to_connack_return_code(&self) -> u8 {
        match self {
            ReasonCode::Success => 0,
            ReasonCode::UnsupportedProtocol => 1,
            ReasonCode::ClientIdentifierInvalid => 2,
            ReasonCode::ServerUnavailable
            | ReasonCode::ServerBusy
            | ReasonCode::ServerShuttingDown
            | ReasonCode::ServerMoved
            | ReasonCode::UseAnotherServer
            | ReasonCode::ConnectionRateExceeded => 3,
            ReasonCode::BadUsernameOrPassword => 4,
            ReasonCode::NotAuthorized | ReasonCode::BadAuthMethod | ReasonCode::Banned => 5,
            _ => 1,
        }
    }

    /// The closest MQTT 3.x SUBACK return code for this reason.
    pub fn to_legacy_suback_code(&self) -> u8 {
        match self {
            ReasonCode::Success | ReasonCode::GrantedQos1 | ReasonCode::GrantedQos2 => self.into(),
            _ => 0x80,
        }
    }
}
