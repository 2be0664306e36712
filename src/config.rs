use crate::{
    logging::Logger,
    packets::Connect,
    properties::Property,
    ProtocolError, ProtocolVersion, QoS, Will,
};
use serde::Deserialize;
use std::time::Duration;

/// Configuration specifying the operational state of the MQTT client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) client_id: String,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) clean_session: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) communication_timeout: Duration,
    pub(crate) retransmit_interval: Duration,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) will: Option<Will>,
    pub(crate) session_expiry_interval: Option<u32>,
    pub(crate) receive_maximum: Option<u16>,
    pub(crate) maximum_packet_size: Option<u32>,
    pub(crate) user_properties: Vec<(String, String)>,
    pub(crate) authentication: Option<(String, Vec<u8>)>,
    pub(crate) logger: Logger,
}

impl ClientOptions {
    /// Construct configuration for the MQTT client.
    ///
    /// # Args
    /// * `client_id` - The client identifier. If empty, the broker will assign an identifier.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::V500,
            clean_session: true,
            keep_alive: Duration::from_secs(15),
            communication_timeout: Duration::from_secs(10),
            retransmit_interval: Duration::from_secs(10),
            username: None,
            password: None,
            will: None,
            session_expiry_interval: None,
            receive_maximum: None,
            maximum_packet_size: None,
            user_properties: Vec::new(),
            authentication: None,
            logger: Logger::default().with_source("client"),
        }
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Specify if any session state held by the broker should be discarded on connection.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Configure the MQTT keep-alive interval.
    ///
    /// # Note
    /// The broker may override the requested keep-alive interval. Any value requested by the
    /// broker will be used instead.
    ///
    /// # Args
    /// * `interval` - The keep-alive interval. A ping will be transmitted if no other
    /// messages are sent within 50% of the interval. Zero disables keep-alive.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// The time to wait for a response packet before an operation fails.
    pub fn communication_timeout(mut self, timeout: Duration) -> Self {
        self.communication_timeout = timeout;
        self
    }

    /// The time after which unacknowledged publications are retransmitted.
    pub fn retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = interval;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: Option<&[u8]>) -> Self {
        self.username = Some(username.into());
        self.password = password.map(|password| password.to_vec());
        self
    }

    /// Specify the Will message to be sent if the client disconnects.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Request that the broker keep session state for the provided number of seconds after a
    /// disconnection. Only used with MQTT v5.
    pub fn session_expiry_interval(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = Some(seconds);
        self
    }

    /// The maximum number of inbound QoS 1 and QoS 2 exchanges the client accepts concurrently.
    pub fn receive_maximum(mut self, maximum: u16) -> Self {
        self.receive_maximum = Some(maximum);
        self
    }

    /// The largest packet the client accepts from the broker.
    pub fn maximum_packet_size(mut self, size: u32) -> Self {
        self.maximum_packet_size = Some(size);
        self
    }

    pub fn user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Use enhanced authentication. Only used with MQTT v5.
    pub fn authentication(mut self, method: impl Into<String>, data: &[u8]) -> Self {
        self.authentication = Some((method.into(), data.to_vec()));
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Generate the CONNECT packet described by the options.
    pub(crate) fn connect_packet(&self, clean_session: bool) -> Result<Connect, ProtocolError> {
        let mut connect = Connect::new(self.client_id.clone(), self.protocol_version);
        connect.clean_session = clean_session;
        connect.keep_alive = self.keep_alive.as_secs().min(u16::MAX as u64) as u16;
        connect.username = self.username.clone();
        connect.password = self.password.clone();
        connect.will = self.will.clone();

        if self.protocol_version == ProtocolVersion::V500 {
            let properties = &mut connect.properties;
            if let Some(interval) = self.session_expiry_interval {
                properties.push(Property::SessionExpiryInterval(interval));
            }
            if let Some(maximum) = self.receive_maximum {
                properties.push(Property::ReceiveMaximum(maximum));
            }
            if let Some(size) = self.maximum_packet_size {
                properties.push(Property::MaximumPacketSize(size));
            }
            if let Some((method, data)) = &self.authentication {
                properties.push(Property::AuthenticationMethod(method.clone()));
                properties.push(Property::AuthenticationData(data.clone()));
            }
            for (key, value) in self.user_properties.iter() {
                properties.push(Property::UserProperty(key.clone(), value.clone()));
            }
        }

        connect.validate()?;
        Ok(connect)
    }
}

/// What happens to a session queue that is full when another message arrives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Drop the oldest queued message to make room.
    DropOldestQueuedMessage,

    /// Drop the arriving message.
    DropNewMessage,
}

mod seconds {
    use serde::{de::Error, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom("duration must be a non-negative number of seconds"));
        }

        Ok(Duration::from_secs_f64(secs))
    }
}

/// Configuration of the broker.
///
/// Durations are given in seconds when the options are deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// The time to wait for CONNECT on new connections and for responses.
    #[serde(with = "seconds")]
    pub communication_timeout: Duration,

    /// The depth of each session's pending message queue.
    pub max_pending_messages_per_client: usize,

    pub overflow_strategy: OverflowStrategy,

    /// The highest QoS granted to subscriptions and accepted from publishers.
    pub maximum_qos: QoS,

    pub retain_available: bool,

    /// Connections are closed after `keep_alive * keep_alive_tolerance` without traffic.
    pub keep_alive_tolerance: f64,

    #[serde(with = "seconds")]
    pub retransmit_interval: Duration,

    /// The largest packet the broker accepts. Announced to MQTT v5 clients.
    pub maximum_packet_size: Option<u32>,

    /// Allow sessions to outlive their connections.
    pub persistent_sessions: bool,

    /// How often expired sessions are removed.
    #[serde(with = "seconds")]
    pub session_purge_interval: Duration,

    #[serde(skip)]
    pub logger: Logger,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            communication_timeout: Duration::from_secs(10),
            max_pending_messages_per_client: 250,
            overflow_strategy: OverflowStrategy::DropOldestQueuedMessage,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            keep_alive_tolerance: 1.5,
            retransmit_interval: Duration::from_secs(10),
            maximum_packet_size: None,
            persistent_sessions: true,
            session_purge_interval: Duration::from_secs(60),
            logger: Logger::default().with_source("broker"),
        }
    }
}

impl BrokerOptions {
    pub fn communication_timeout(mut self, timeout: Duration) -> Self {
        self.communication_timeout = timeout;
        self
    }

    pub fn max_pending_messages_per_client(mut self, depth: usize) -> Self {
        self.max_pending_messages_per_client = depth;
        self
    }

    pub fn overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = strategy;
        self
    }

    pub fn maximum_qos(mut self, qos: QoS) -> Self {
        self.maximum_qos = qos;
        self
    }

    pub fn retain_available(mut self, available: bool) -> Self {
        self.retain_available = available;
        self
    }

    pub fn keep_alive_tolerance(mut self, tolerance: f64) -> Self {
        self.keep_alive_tolerance = tolerance;
        self
    }

    pub fn retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = interval;
        self
    }

    pub fn maximum_packet_size(mut self, size: u32) -> Self {
        self.maximum_packet_size = Some(size);
        self
    }

    pub fn persistent_sessions(mut self, enabled: bool) -> Self {
        self.persistent_sessions = enabled;
        self
    }

    pub fn session_purge_interval(mut self, interval: Duration) -> Self {
        self.session_purge_interval = interval;
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}

/// Configuration of a [crate::ManagedClient].
#[derive(Debug, Clone)]
pub struct ManagedClientOptions {
    pub(crate) client: ClientOptions,
    pub(crate) reconnect_delay: Duration,
    pub(crate) connection_check_interval: Duration,
    pub(crate) max_pending_messages: usize,
    pub(crate) overflow_strategy: OverflowStrategy,
}

impl ManagedClientOptions {
    pub fn new(client: ClientOptions) -> Self {
        Self {
            client,
            reconnect_delay: Duration::from_secs(5),
            connection_check_interval: Duration::from_secs(1),
            max_pending_messages: usize::MAX,
            overflow_strategy: OverflowStrategy::DropNewMessage,
        }
    }

    /// The pause between failed connection attempts.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// How often the connection is checked while it is up.
    pub fn connection_check_interval(mut self, interval: Duration) -> Self {
        self.connection_check_interval = interval;
        self
    }

    /// Bound the queue of publications waiting for a connection.
    pub fn max_pending_messages(mut self, depth: usize, strategy: OverflowStrategy) -> Self {
        self.max_pending_messages = depth;
        self.overflow_strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v5_connect_properties() {
        let options = ClientOptions::new("sensor")
            .keep_alive(Duration::from_secs(30))
            .session_expiry_interval(600)
            .receive_maximum(4)
            .credentials("user", Some(b"secret"))
            .user_property("site", "lab");

        let connect = options.connect_packet(false).unwrap();
        assert_eq!(connect.keep_alive, 30);
        assert!(!connect.clean_session);
        assert_eq!(connect.username.as_deref(), Some("user"));
        assert_eq!(
            connect.properties,
            vec![
                Property::SessionExpiryInterval(600),
                Property::ReceiveMaximum(4),
                Property::UserProperty("site".into(), "lab".into()),
            ]
        );
    }

    #[test]
    fn v3_connect_has_no_properties() {
        let options = ClientOptions::new("sensor")
            .protocol_version(ProtocolVersion::V311)
            .session_expiry_interval(600);

        assert!(options.connect_packet(true).unwrap().properties.is_empty());
    }

    #[test]
    fn empty_client_id_requires_clean_session() {
        assert_eq!(
            ClientOptions::new("").connect_packet(false),
            Err(ProtocolError::EmptyClientIdWithoutCleanSession)
        );
    }

    #[test]
    fn broker_options_from_json() {
        let options: BrokerOptions = serde_json::from_str(
            r#"{
                "communication_timeout": 2.5,
                "max_pending_messages_per_client": 10,
                "overflow_strategy": "drop_new_message",
                "maximum_qos": "AtLeastOnce",
                "persistent_sessions": false
            }"#,
        )
        .unwrap();

        assert_eq!(options.communication_timeout, Duration::from_millis(2500));
        assert_eq!(options.max_pending_messages_per_client, 10);
        assert_eq!(options.overflow_strategy, OverflowStrategy::DropNewMessage);
        assert_eq!(options.maximum_qos, QoS::AtLeastOnce);
        assert!(!options.persistent_sessions);
        assert!(options.retain_available);
        assert_eq!(options.keep_alive_tolerance, 1.5);
    }

    #[test]
    fn negative_durations_rejected() {
        let result = serde_json::from_str::<BrokerOptions>(r#"{"retransmit_interval": -1}"#);
        assert!(result.is_err());
    }
}
