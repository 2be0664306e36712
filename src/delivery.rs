//! The QoS delivery engine.
//!
//! One engine exists per MQTT session and drives both directions of the publish handshakes:
//!
//! * Outbound publications are assigned packet identifiers and tracked until PUBACK (QoS 1) or
//!   PUBREC, PUBREL and PUBCOMP (QoS 2) complete the exchange. Unacknowledged exchanges are
//!   retransmitted with the duplicate flag set.
//! * Inbound QoS 2 publications are held until PUBREL arrives, so that a duplicate PUBLISH never
//!   reaches the application twice.
//!
//! The engine performs no I/O. Every handler returns the packets that must be written to the
//! peer, which keeps it usable from both the client and the broker connection engines.
use crate::{
    design_parameters::{DEFAULT_RECEIVE_MAXIMUM, MAX_PROCESSED_IDENTIFIERS},
    logging::Logger,
    packets::{Packet, PubResponse, Publish},
    reason_codes::ReasonCode,
    republication::{Completion, RepublicationBuffer},
    CommunicationError, Error, QoS,
};
use heapless::Deque;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::{Duration, Instant};

pub use crate::republication::ExchangeState;

/// The result of processing an inbound publish handshake packet.
#[derive(Debug, Default, PartialEq)]
pub struct Inbound {
    /// A publication that must be handed to the application.
    pub deliver: Option<Publish>,

    /// The acknowledgement to write to the peer.
    pub reply: Option<Packet>,
}

pub struct DeliveryEngine {
    next_packet_id: u16,
    reserved: HashSet<u16>,
    outbound: RepublicationBuffer,
    queued: VecDeque<(Publish, Option<Completion>)>,
    incoming: HashMap<u16, Publish>,
    processed: Deque<u16, MAX_PROCESSED_IDENTIFIERS>,
    receive_maximum: u16,
    retransmit_interval: Duration,
    log: Logger,
}

fn disconnected() -> Error {
    Error::Communication(CommunicationError::Disconnected)
}

impl DeliveryEngine {
    pub fn new(retransmit_interval: Duration, log: Logger) -> Self {
        Self {
            next_packet_id: 1,
            reserved: HashSet::new(),
            outbound: RepublicationBuffer::default(),
            queued: VecDeque::new(),
            incoming: HashMap::new(),
            processed: Deque::new(),
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            retransmit_interval,
            log,
        }
    }

    /// Limit the number of concurrent outbound QoS 1 and QoS 2 exchanges.
    ///
    /// A value of zero restores the protocol default.
    pub fn set_receive_maximum(&mut self, maximum: u16) {
        self.receive_maximum = if maximum == 0 {
            DEFAULT_RECEIVE_MAXIMUM
        } else {
            maximum
        };
    }

    pub fn set_retransmit_interval(&mut self, interval: Duration) {
        self.retransmit_interval = interval;
    }

    fn in_use(&self, id: u16) -> bool {
        self.reserved.contains(&id) || self.outbound.contains(id)
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };

            if !self.in_use(id) {
                return Some(id);
            }
        }

        None
    }

    /// Reserve a packet identifier for a SUBSCRIBE or UNSUBSCRIBE request.
    ///
    /// The identifier is never handed out again until it is released.
    pub fn reserve_packet_id(&mut self) -> Option<u16> {
        let id = self.allocate_packet_id()?;
        self.reserved.insert(id);
        Some(id)
    }

    pub fn release_packet_id(&mut self, id: u16) {
        self.reserved.remove(&id);
    }

    /// True if another QoS 1 or QoS 2 exchange may be started immediately.
    pub fn has_capacity(&self) -> bool {
        self.outbound.len() < self.receive_maximum as usize
    }

    /// The number of outbound exchanges awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    /// The number of outbound publications held back by flow control.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// True if nothing is in flight in either direction.
    pub fn is_idle(&self) -> bool {
        !self.outbound.pending_transactions() && self.queued.is_empty() && self.incoming.is_empty()
    }

    /// The identifiers and states of the outbound exchanges in transmission order.
    pub fn exchanges(&self) -> Vec<(u16, ExchangeState)> {
        self.outbound.states().collect()
    }

    /// Start delivering a publication.
    ///
    /// # Returns
    /// The packet to transmit, or `None` if the publication is held back until an in-flight
    /// exchange completes. QoS 0 publications complete as soon as they are returned.
    pub fn send(&mut self, mut publish: Publish, completion: Option<Completion>) -> Option<Packet> {
        publish.dup = false;

        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            if let Some(completion) = completion {
                completion.send(Ok(())).ok();
            }
            return Some(Packet::Publish(publish));
        }

        if !self.queued.is_empty() || !self.has_capacity() {
            self.log.debug(format_args!(
                "Holding back publication to `{}`: {} exchanges in flight",
                publish.topic,
                self.outbound.len()
            ));
            self.queued.push_back((publish, completion));
            return None;
        }

        self.start(publish, completion)
    }

    fn start(&mut self, mut publish: Publish, completion: Option<Completion>) -> Option<Packet> {
        let Some(id) = self.allocate_packet_id() else {
            self.queued.push_front((publish, completion));
            return None;
        };

        publish.packet_id = Some(id);
        self.outbound
            .push_publish(publish.clone(), completion, Instant::now());
        Some(Packet::Publish(publish))
    }

    /// Start held back publications while the peer's receive maximum allows.
    fn release_queued(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while self.has_capacity() {
            let Some((publish, completion)) = self.queued.pop_front() else {
                break;
            };

            match self.start(publish, completion) {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }

        packets
    }

    pub fn handle_puback(&mut self, ack: &PubResponse) -> Vec<Packet> {
        match self
            .outbound
            .pop_exchange(ack.packet_id, ExchangeState::AwaitingPubAck)
        {
            Ok(mut exchange) => exchange.complete(ack.reason_code.as_result()),
            Err(_) => self.log.warn(format_args!(
                "Ignoring PUBACK for unknown identifier {}",
                ack.packet_id
            )),
        }

        self.release_queued()
    }

    pub fn handle_pubrec(&mut self, rec: &PubResponse) -> Vec<Packet> {
        let Some(exchange) = self.outbound.find_mut(rec.packet_id) else {
            self.log.warn(format_args!(
                "PUBREC for unknown identifier {}",
                rec.packet_id
            ));
            return vec![Packet::PubRel(PubResponse::with_reason(
                rec.packet_id,
                ReasonCode::PacketIdNotFound,
            ))];
        };

        let state = exchange.state;
        match state {
            ExchangeState::AwaitingPubAck => {
                self.log.warn(format_args!(
                    "PUBREC received for QoS 1 exchange {}",
                    rec.packet_id
                ));
                Vec::new()
            }

            // The peer refused the publication and the exchange ends here.
            ExchangeState::AwaitingPubRec if rec.reason_code.failed() => {
                if let Ok(mut exchange) = self
                    .outbound
                    .pop_exchange(rec.packet_id, ExchangeState::AwaitingPubRec)
                {
                    exchange.complete(Err(Error::Failed(rec.reason_code)));
                }
                self.release_queued()
            }

            ExchangeState::AwaitingPubRec | ExchangeState::AwaitingPubComp => {
                exchange.state = ExchangeState::AwaitingPubComp;
                exchange.last_sent = Instant::now();
                vec![Packet::PubRel(PubResponse::new(rec.packet_id))]
            }
        }
    }

    pub fn handle_pubcomp(&mut self, comp: &PubResponse) -> Vec<Packet> {
        match self
            .outbound
            .pop_exchange(comp.packet_id, ExchangeState::AwaitingPubComp)
        {
            Ok(mut exchange) => exchange.complete(comp.reason_code.as_result()),
            Err(_) => self.log.warn(format_args!(
                "Ignoring PUBCOMP for unknown identifier {}",
                comp.packet_id
            )),
        }

        self.release_queued()
    }

    /// End an outbound exchange that can never be transmitted, e.g. because the publication
    /// exceeds the maximum packet size of the peer.
    pub fn abandon(&mut self, packet_id: u16, reason: ReasonCode) -> Vec<Packet> {
        if let Some(mut exchange) = self.outbound.remove(packet_id) {
            exchange.complete(Err(Error::Failed(reason)));
        }

        self.release_queued()
    }

    fn remember_processed(&mut self, id: u16) {
        if self.processed.iter().any(|&processed| processed == id) {
            return;
        }

        if self.processed.is_full() {
            self.processed.pop_front();
        }

        self.processed.push_back(id).ok();
    }

    fn forget_processed(&mut self, id: u16) {
        let remaining: Vec<u16> = self
            .processed
            .iter()
            .copied()
            .filter(|&processed| processed != id)
            .collect();

        self.processed.clear();
        for id in remaining {
            self.processed.push_back(id).ok();
        }
    }

    fn was_processed(&self, id: u16) -> bool {
        self.processed.iter().any(|&processed| processed == id)
    }

    /// Process an inbound PUBLISH.
    pub fn handle_publish(&mut self, publish: Publish) -> Inbound {
        let Some(id) = publish.packet_id else {
            return Inbound {
                deliver: Some(publish),
                reply: None,
            };
        };

        // A fresh publication reuses an identifier whose previous exchange has completed.
        if !publish.dup {
            self.forget_processed(id);
        }

        match publish.qos {
            QoS::AtMostOnce => Inbound {
                deliver: Some(publish),
                reply: None,
            },

            QoS::AtLeastOnce => {
                let reply = Some(Packet::PubAck(PubResponse::new(id)));
                if publish.dup && self.was_processed(id) {
                    self.log
                        .debug(format_args!("Suppressing duplicate QoS 1 publication {}", id));
                    return Inbound {
                        deliver: None,
                        reply,
                    };
                }

                self.remember_processed(id);
                Inbound {
                    deliver: Some(publish),
                    reply,
                }
            }

            QoS::ExactlyOnce => {
                let reply = Some(Packet::PubRec(PubResponse::new(id)));
                if self.incoming.contains_key(&id) || (publish.dup && self.was_processed(id)) {
                    self.log
                        .debug(format_args!("Suppressing duplicate QoS 2 publication {}", id));
                } else {
                    self.incoming.insert(id, publish);
                }

                Inbound {
                    deliver: None,
                    reply,
                }
            }
        }
    }

    /// Process an inbound PUBREL, releasing the held publication to the application.
    pub fn handle_pubrel(&mut self, rel: &PubResponse) -> Inbound {
        let id = rel.packet_id;
        match self.incoming.remove(&id) {
            Some(publish) => {
                self.remember_processed(id);
                Inbound {
                    deliver: Some(publish),
                    reply: Some(Packet::PubComp(PubResponse::new(id))),
                }
            }

            // PUBCOMP was lost and the peer retransmitted PUBREL.
            None if self.was_processed(id) => Inbound {
                deliver: None,
                reply: Some(Packet::PubComp(PubResponse::new(id))),
            },

            None => {
                self.log
                    .warn(format_args!("PUBREL for unknown identifier {}", id));
                Inbound {
                    deliver: None,
                    reply: Some(Packet::PubComp(PubResponse::with_reason(
                        id,
                        ReasonCode::PacketIdNotFound,
                    ))),
                }
            }
        }
    }

    /// Packets for every outbound exchange that was not acknowledged within the retransmit
    /// interval.
    pub fn retransmissions(&mut self, now: Instant) -> Vec<Packet> {
        let packets = self
            .outbound
            .due_republications(now, self.retransmit_interval);
        if !packets.is_empty() {
            self.log
                .info(format_args!("Retransmitting {} exchanges", packets.len()));
        }
        packets
    }

    /// Continue the session on a new connection.
    ///
    /// If the peer kept the session, every in-flight exchange is retransmitted from its current
    /// step. Otherwise all inbound state is dropped and outbound publications start over.
    pub fn resume(&mut self, session_present: bool) -> Vec<Packet> {
        if !session_present {
            self.outbound.restart();
            self.incoming.clear();
            self.processed.clear();
        }

        self.reserved.clear();
        let mut packets = self.outbound.republish_all(Instant::now(), session_present);
        packets.extend(self.release_queued());
        packets
    }

    /// Fail every waiting publisher after the connection was lost. Exchanges are kept for
    /// resumption.
    pub fn disconnected(&mut self) {
        self.outbound.fail_completions(disconnected);
        for (_, completion) in self.queued.iter_mut() {
            if let Some(completion) = completion.take() {
                completion.send(Err(disconnected())).ok();
            }
        }
        self.reserved.clear();
    }

    /// Discard all session state.
    pub fn clear(&mut self) {
        self.outbound.clear(disconnected);
        for (_, completion) in self.queued.drain(..) {
            if let Some(completion) = completion {
                completion.send(Err(disconnected())).ok();
            }
        }
        self.incoming.clear();
        self.processed.clear();
        self.reserved.clear();
        self.next_packet_id = 1;
    }
}
