use crate::{
    packets::{Packet, PubResponse, Publish},
    Error, ProtocolError,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Signalled once an outbound exchange completes or is abandoned.
pub(crate) type Completion = oneshot::Sender<Result<(), Error>>;

/// The step an outbound exchange is waiting on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    /// A QoS 1 publish awaits PUBACK.
    AwaitingPubAck,

    /// A QoS 2 publish awaits PUBREC.
    AwaitingPubRec,

    /// PUBREL was sent for a QoS 2 publish and awaits PUBCOMP.
    AwaitingPubComp,
}

pub(crate) struct Exchange {
    pub publish: Publish,
    pub state: ExchangeState,
    pub last_sent: Instant,
    completion: Option<Completion>,
}

impl Exchange {
    pub fn packet_id(&self) -> u16 {
        self.publish.packet_id.unwrap_or_default()
    }

    pub fn complete(&mut self, result: Result<(), Error>) {
        if let Some(completion) = self.completion.take() {
            // The publisher may have stopped waiting.
            completion.send(result).ok();
        }
    }

    /// The packet that restarts the exchange from its current step.
    fn retransmission(&self, dup: bool) -> Packet {
        match self.state {
            ExchangeState::AwaitingPubComp => Packet::PubRel(PubResponse::new(self.packet_id())),
            _ => {
                let mut publish = self.publish.clone();
                publish.dup = dup;
                Packet::Publish(publish)
            }
        }
    }
}

/// Outbound exchanges that have been transmitted but not yet completed, in transmission order.
///
/// The buffer outlives connections so that exchanges can be retransmitted when a session is
/// resumed.
#[derive(Default)]
pub(crate) struct RepublicationBuffer {
    exchanges: VecDeque<Exchange>,
}

impl RepublicationBuffer {
    pub fn push_publish(&mut self, publish: Publish, completion: Option<Completion>, now: Instant) {
        let state = match publish.qos {
            crate::QoS::ExactlyOnce => ExchangeState::AwaitingPubRec,
            _ => ExchangeState::AwaitingPubAck,
        };

        self.exchanges.push_back(Exchange {
            publish,
            state,
            last_sent: now,
            completion,
        });
    }

    /// Remove the exchange with the provided identifier if it is in the expected state.
    pub fn pop_exchange(
        &mut self,
        id: u16,
        expected: ExchangeState,
    ) -> Result<Exchange, ProtocolError> {
        let index = self
            .exchanges
            .iter()
            .position(|exchange| exchange.packet_id() == id && exchange.state == expected)
            .ok_or(ProtocolError::BadIdentifier)?;

        self.exchanges
            .remove(index)
            .ok_or(ProtocolError::BadIdentifier)
    }

    /// Remove an exchange regardless of its state.
    pub fn remove(&mut self, id: u16) -> Option<Exchange> {
        let index = self
            .exchanges
            .iter()
            .position(|exchange| exchange.packet_id() == id)?;
        self.exchanges.remove(index)
    }

    pub fn find_mut(&mut self, id: u16) -> Option<&mut Exchange> {
        self.exchanges
            .iter_mut()
            .find(|exchange| exchange.packet_id() == id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.exchanges.iter().any(|exchange| exchange.packet_id() == id)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn pending_transactions(&self) -> bool {
        !self.exchanges.is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = (u16, ExchangeState)> + '_ {
        self.exchanges
            .iter()
            .map(|exchange| (exchange.packet_id(), exchange.state))
    }

    /// Packets for every exchange that has not progressed within the interval.
    pub fn due_republications(&mut self, now: Instant, interval: Duration) -> Vec<Packet> {
        self.exchanges
            .iter_mut()
            .filter(|exchange| now.saturating_duration_since(exchange.last_sent) >= interval)
            .map(|exchange| {
                exchange.last_sent = now;
                exchange.retransmission(true)
            })
            .collect()
    }

    /// Packets for every exchange, used when a session continues on a new connection.
    pub fn republish_all(&mut self, now: Instant, dup: bool) -> Vec<Packet> {
        self.exchanges
            .iter_mut()
            .map(|exchange| {
                exchange.last_sent = now;
                exchange.retransmission(dup)
            })
            .collect()
    }

    /// Restart exchanges for a peer that holds no session state.
    ///
    /// Publications are sent again from the start. Exchanges that already reached PUBREL were
    /// received by the peer and are completed.
    pub fn restart(&mut self) {
        for exchange in self.exchanges.iter_mut() {
            if exchange.state == ExchangeState::AwaitingPubComp {
                exchange.complete(Ok(()));
            }
        }

        self.exchanges
            .retain(|exchange| exchange.state != ExchangeState::AwaitingPubComp);

        for exchange in self.exchanges.iter_mut() {
            exchange.publish.dup = false;
            exchange.state = match exchange.publish.qos {
                crate::QoS::ExactlyOnce => ExchangeState::AwaitingPubRec,
                _ => ExchangeState::AwaitingPubAck,
            };
        }
    }

    /// Fail every waiting publisher. The exchanges themselves are kept.
    pub fn fail_completions(&mut self, make_error: impl Fn() -> Error) {
        for exchange in self.exchanges.iter_mut() {
            exchange.complete(Err(make_error()));
        }
    }

    pub fn clear(&mut self, make_error: impl Fn() -> Error) {
        self.fail_completions(make_error);
        self.exchanges.clear();
    }
}
