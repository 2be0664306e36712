//! # omnimq
//!
//! An MQTT protocol engine covering protocol versions 3.1, 3.1.1 and 5.0.
//!
//! The crate is split into the pieces an MQTT endpoint needs:
//!
//! * A bit-exact packet codec ([codec]) built on a serde [Serializer](ser::MqttSerializer) and
//!   [Deserializer](de::MqttDeserializer) for the MQTT primitive types.
//! * A QoS delivery engine ([delivery::DeliveryEngine]) that drives the QoS 1 and QoS 2
//!   handshakes and hands out packet identifiers.
//! * A packet awaiter ([dispatcher::PacketDispatcher]) that correlates requests with their
//!   response packets.
//! * A topic matcher and subscription index ([topic]).
//! * A session and retained message store ([sessions::SessionStore]).
//! * Connection engines for both sides of the protocol: [MqttClient], [ManagedClient] and
//!   [MqttBroker].
//!
//! Transports are supplied by the user through the [Transport](transport::Transport) trait.
//! Implementations are provided for TCP and for any tokio byte stream.
//!
//! ## Example
//! ```no_run
//! use omnimq::{ClientOptions, MqttClient, Publication, QoS, TcpTransport};
//!
//! # async fn run() -> Result<(), omnimq::Error> {
//! let transport = TcpTransport::new("127.0.0.1:1883");
//! let client = MqttClient::new(transport, ClientOptions::new("sensor-1"));
//! client.connect().await?;
//!
//! let message = Publication::new("21.5")
//!     .topic("sensors/temperature")
//!     .qos(QoS::AtLeastOnce)
//!     .finish()?;
//! client.publish(message).await?;
//! # Ok(())
//! # }
//! ```
pub mod broker;
mod channel;
pub mod codec;
pub mod config;
mod connection;
pub mod de;
pub mod delivery;
mod design_parameters;
pub mod dispatcher;
pub mod events;
pub mod interceptors;
pub mod logging;
pub mod managed_client;
mod message_types;
pub mod mqtt_client;
pub mod packets;
pub mod properties;
pub mod publication;
pub mod reason_codes;
mod republication;
pub mod retained;
pub mod ser;
pub mod session;
mod session_state;
pub mod sessions;
pub mod storage;
pub mod topic;
pub mod transport;
pub mod types;
mod varint;
pub mod will;

pub use broker::MqttBroker;
pub use config::{BrokerOptions, ClientOptions, ManagedClientOptions, OverflowStrategy};
pub use managed_client::ManagedClient;
pub use message_types::MessageType;
pub use mqtt_client::MqttClient;
pub use packets::Packet;
pub use properties::Property;
pub use publication::{ApplicationMessage, Publication};
pub use reason_codes::ReasonCode;
pub use transport::{StreamTransport, TcpTransport};
pub use will::Will;

pub(crate) use log::{debug, trace, warn};

use num_enum::TryFromPrimitive;

/// The quality-of-service for an MQTT message.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(u8)]
pub enum QoS {
    /// A packet will be delivered at most once, but may not be delivered at all.
    AtMostOnce = 0,

    /// A packet will be delivered at least one time, but possibly more than once.
    AtLeastOnce = 1,

    /// A packet will be delivered exactly one time.
    ExactlyOnce = 2,
}

/// The MQTT protocol revision spoken on a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`.
    V310 = 3,

    /// MQTT 3.1.1, protocol name `MQTT`.
    V311 = 4,

    /// MQTT 5.0, protocol name `MQTT`.
    V500 = 5,
}

impl ProtocolVersion {
    /// The protocol name transmitted in CONNECT for this revision.
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolVersion::V310 => "MQIsdp",
            ProtocolVersion::V311 | ProtocolVersion::V500 => "MQTT",
        }
    }
}

/// Violations of the MQTT protocol. These are always fatal to the connection that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    RemainingLengthInvalid,
    MalformedPacket,
    InvalidFixedHeaderFlags,
    InvalidProtocolName,
    UnsupportedProtocolVersion,
    ReservedFlagSet,
    InvalidQoS,
    MissingPacketIdentifier,
    UnexpectedPacketIdentifier,
    DupFlagWithoutQoS,
    EmptyClientIdWithoutCleanSession,
    PasswordWithoutUsername,
    UnknownProperty,
    PropertyNotAllowed,
    EmptySubscription,
    InvalidTopicFilter,
    InvalidTopicName,
    PacketTooLarge,
    UnsupportedPacket,
    UnexpectedPacket,
    BadIdentifier,
    NoTopic,
    Serialization(ser::Error),
    Deserialization(de::Error),
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ProtocolError::RemainingLengthInvalid => write!(f, "remaining length invalid"),
            ProtocolError::MalformedPacket => write!(f, "malformed packet"),
            ProtocolError::InvalidFixedHeaderFlags => write!(f, "invalid fixed header flags"),
            ProtocolError::InvalidProtocolName => write!(f, "protocol name does not match"),
            ProtocolError::UnsupportedProtocolVersion => write!(f, "unsupported protocol level"),
            ProtocolError::ReservedFlagSet => {
                write!(f, "the first bit of the connect flags must be set to 0")
            }
            ProtocolError::InvalidQoS => write!(f, "invalid QoS level"),
            ProtocolError::MissingPacketIdentifier => write!(f, "packet has no packet identifier"),
            ProtocolError::UnexpectedPacketIdentifier => {
                write!(f, "packet identifier must be absent if QoS is 0")
            }
            ProtocolError::DupFlagWithoutQoS => write!(f, "dup flag must be false for QoS 0"),
            ProtocolError::EmptyClientIdWithoutCleanSession => {
                write!(f, "clean session must be set if the client id is empty")
            }
            ProtocolError::PasswordWithoutUsername => {
                write!(f, "a password requires a user name")
            }
            ProtocolError::UnknownProperty => write!(f, "unknown property identifier"),
            ProtocolError::PropertyNotAllowed => write!(f, "property not allowed in packet"),
            ProtocolError::EmptySubscription => write!(f, "at least one topic filter must be set"),
            ProtocolError::InvalidTopicFilter => write!(f, "invalid topic filter"),
            ProtocolError::InvalidTopicName => write!(f, "invalid topic name"),
            ProtocolError::PacketTooLarge => write!(f, "packet exceeds the maximum packet size"),
            ProtocolError::UnsupportedPacket => write!(f, "packet type not supported"),
            ProtocolError::UnexpectedPacket => write!(f, "packet received at an unexpected time"),
            ProtocolError::BadIdentifier => write!(f, "unknown packet identifier"),
            ProtocolError::NoTopic => write!(f, "no publication topic was specified"),
            ProtocolError::Serialization(e) => write!(f, "serialization failed: {}", e),
            ProtocolError::Deserialization(e) => write!(f, "deserialization failed: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ser::Error> for ProtocolError {
    fn from(err: ser::Error) -> Self {
        ProtocolError::Serialization(err)
    }
}

impl From<de::Error> for ProtocolError {
    fn from(err: de::Error) -> Self {
        match err {
            de::Error::MalformedInteger => ProtocolError::RemainingLengthInvalid,
            other => ProtocolError::Deserialization(other),
        }
    }
}

/// Transport-level failures.
#[derive(Debug)]
pub enum CommunicationError {
    /// The peer closed the byte stream.
    Closed,

    /// The connection was shut down while the operation was outstanding.
    Disconnected,

    /// The underlying transport reported an error.
    Io(std::io::Error),
}

impl core::fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            CommunicationError::Closed => write!(f, "connection closed"),
            CommunicationError::Disconnected => write!(f, "disconnected"),
            CommunicationError::Io(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommunicationError::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// Errors surfaced by the connection engines.
#[derive(Debug)]
pub enum Error {
    /// The peer violated the protocol. Never retried.
    Protocol(ProtocolError),

    /// The transport failed.
    Communication(CommunicationError),

    /// An awaited response did not arrive in time.
    TimedOut,

    /// The operation requires an established connection.
    NotConnected,

    /// A connection is already established or being established.
    AlreadyConnected,

    /// The peer refused the request with the provided reason code.
    Failed(ReasonCode),

    /// Durable storage failed.
    Storage(String),
}

impl Error {
    /// True for transport failures, including timeouts.
    pub fn is_communication(&self) -> bool {
        matches!(self, Error::Communication(_) | Error::TimedOut)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "protocol violation: {}", e),
            Error::Communication(e) => write!(f, "{}", e),
            Error::TimedOut => write!(f, "communication timed out"),
            Error::NotConnected => write!(f, "not connected"),
            Error::AlreadyConnected => write!(f, "already connected"),
            Error::Failed(code) => write!(f, "request failed: {:?}", code),
            Error::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(error) => Some(error),
            Error::Communication(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<CommunicationError> for Error {
    fn from(err: CommunicationError) -> Self {
        Error::Communication(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Communication(CommunicationError::Io(err))
    }
}

impl From<ReasonCode> for Error {
    fn from(code: ReasonCode) -> Self {
        Error::Failed(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn transport_failures_chain_their_cause() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = Error::from(reset);
        assert!(error.is_communication());

        let communication = error.source().unwrap();
        assert_eq!(communication.to_string(), "transport error: reset by peer");
        assert_eq!(communication.source().unwrap().to_string(), "reset by peer");

        let closed: Box<dyn std::error::Error> = Box::new(CommunicationError::Closed);
        assert_eq!(closed.to_string(), "connection closed");
        assert!(closed.source().is_none());
    }
}
