//! The client's view of its connection to a broker.
//!
//! This holds the limits announced by the broker in CONNACK and the keep-alive bookkeeping.
//! Publication state lives in the [DeliveryEngine](crate::delivery::DeliveryEngine).
use crate::{
    design_parameters::DEFAULT_RECEIVE_MAXIMUM, packets::ConnAck, properties::PropertiesExt, QoS,
};
use core::convert::TryFrom;
use tokio::time::{Duration, Instant};

/// What the keep-alive timer requires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PingAction {
    Idle,

    /// Nothing was written for half of the keep-alive interval.
    Send,

    /// A PINGREQ was not answered in time.
    TimedOut,
}

pub(crate) struct SessionState {
    pub client_id: String,

    /// The keep-alive interval in use. The broker may override the requested interval.
    pub keep_alive: Duration,
    requested_keep_alive: Duration,

    /// If we sent a ping request without having received a response, stores the time
    /// the request was sent.
    pending_ping: Option<Instant>,

    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub maximum_packet_size: Option<u32>,
    pub receive_maximum: u16,

    /// True once the broker confirmed a session for this client.
    present: bool,
}

impl SessionState {
    pub fn new(client_id: impl Into<String>, keep_alive: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive,
            requested_keep_alive: keep_alive,
            pending_ping: None,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            maximum_packet_size: None,
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            present: false,
        }
    }

    /// Determine if the broker holds session state for this client.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Forget everything the broker announced on the previous connection.
    pub fn reset(&mut self) {
        self.keep_alive = self.requested_keep_alive;
        self.pending_ping = None;
        self.maximum_qos = QoS::ExactlyOnce;
        self.retain_available = true;
        self.maximum_packet_size = None;
        self.receive_maximum = DEFAULT_RECEIVE_MAXIMUM;
    }

    /// Adopt the properties of a successful CONNACK.
    pub fn register_connack(&mut self, acknowledge: &ConnAck) {
        self.reset();
        self.present = acknowledge.session_present;

        let properties = &acknowledge.properties;
        if let Some(id) = properties.assigned_client_identifier() {
            self.client_id = id.to_string();
        }
        if let Some(keep_alive) = properties.server_keep_alive() {
            self.keep_alive = Duration::from_secs(keep_alive as u64);
        }
        if let Some(qos) = properties.maximum_qos() {
            self.maximum_qos = QoS::try_from(qos).unwrap_or(QoS::AtMostOnce);
        }
        if let Some(available) = properties.retain_available() {
            self.retain_available = available;
        }
        self.maximum_packet_size = properties.maximum_packet_size();
        if let Some(maximum) = properties.receive_maximum() {
            self.receive_maximum = maximum;
        }
    }

    /// Check the keep-alive timer.
    ///
    /// # Note
    /// The ping timeout is started when a ping is requested, so it is running even if the ping
    /// cannot be written. A stalled transport is then detected through the timeout.
    pub fn handle_ping(&mut self, last_write: Instant, now: Instant, timeout: Duration) -> PingAction {
        if self.keep_alive.is_zero() {
            return PingAction::Idle;
        }

        if let Some(sent) = self.pending_ping {
            return if now.saturating_duration_since(sent) >= timeout {
                PingAction::TimedOut
            } else {
                PingAction::Idle
            };
        }

        if now.saturating_duration_since(last_write) >= self.keep_alive / 2 {
            self.pending_ping = Some(now);
            PingAction::Send
        } else {
            PingAction::Idle
        }
    }

    /// Cancel the ping response timeout.
    pub fn register_ping_response(&mut self) {
        self.pending_ping = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{properties::Property, reason_codes::ReasonCode};

    #[test]
    fn connack_properties() {
        let mut state = SessionState::new("", Duration::from_secs(60));

        let mut ack = ConnAck::new(ReasonCode::Success, true);
        ack.properties = vec![
            Property::AssignedClientIdentifier("assigned".into()),
            Property::ServerKeepAlive(10),
            Property::MaximumQoS(1),
            Property::RetainAvailable(0),
            Property::MaximumPacketSize(1024),
            Property::ReceiveMaximum(4),
        ];
        state.register_connack(&ack);

        assert!(state.is_present());
        assert_eq!(state.client_id, "assigned");
        assert_eq!(state.keep_alive, Duration::from_secs(10));
        assert_eq!(state.maximum_qos, QoS::AtLeastOnce);
        assert!(!state.retain_available);
        assert_eq!(state.maximum_packet_size, Some(1024));
        assert_eq!(state.receive_maximum, 4);

        state.register_connack(&ConnAck::new(ReasonCode::Success, false));
        assert!(!state.is_present());
        assert_eq!(state.keep_alive, Duration::from_secs(60));
        assert_eq!(state.maximum_qos, QoS::ExactlyOnce);
    }

    #[test]
    fn keep_alive_timer() {
        let mut state = SessionState::new("client", Duration::from_secs(10));
        let start = Instant::now();
        let timeout = Duration::from_secs(3);

        assert_eq!(
            state.handle_ping(start, start + Duration::from_secs(4), timeout),
            PingAction::Idle
        );
        assert_eq!(
            state.handle_ping(start, start + Duration::from_secs(5), timeout),
            PingAction::Send
        );
        assert_eq!(
            state.handle_ping(start, start + Duration::from_secs(6), timeout),
            PingAction::Idle
        );
        assert_eq!(
            state.handle_ping(start, start + Duration::from_secs(8), timeout),
            PingAction::TimedOut
        );

        state.register_ping_response();
        let later = start + Duration::from_secs(8);
        assert_eq!(state.handle_ping(later, later, timeout), PingAction::Idle);
    }

    #[test]
    fn keep_alive_disabled() {
        let mut state = SessionState::new("client", Duration::ZERO);
        let start = Instant::now();
        assert_eq!(
            state.handle_ping(start, start + Duration::from_secs(3600), Duration::from_secs(1)),
            PingAction::Idle
        );
    }
}
