//! Correlation of request packets with their responses.
//!
//! A caller registers an awaiter before writing its request, then waits on it. The receive path
//! offers every inbound packet to [PacketDispatcher::try_dispatch], which completes the first
//! awaiter whose predicate matches. Packets that no awaiter wants are handed back for ordinary
//! processing.
use crate::{
    message_types::MessageType,
    packets::{Packet, PacketIdentifier},
    CommunicationError, Error,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

type Predicate = Box<dyn Fn(&Packet) -> bool + Send>;

struct Registration {
    key: u64,
    predicate: Predicate,
    slot: oneshot::Sender<Result<Packet, Error>>,
}

#[derive(Default)]
struct Registry {
    next_key: u64,
    awaiters: Vec<Registration>,
}

/// The table of live awaiters of one connection.
#[derive(Clone, Default)]
pub struct PacketDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the first inbound packet matching a predicate.
    pub fn register<F>(&self, predicate: F) -> PacketAwaiter
    where
        F: Fn(&Packet) -> bool + Send + 'static,
    {
        let (slot, receiver) = oneshot::channel();
        let mut registry = self.registry.lock();
        let key = registry.next_key;
        registry.next_key = registry.next_key.wrapping_add(1);
        registry.awaiters.push(Registration {
            key,
            predicate: Box::new(predicate),
            slot,
        });

        PacketAwaiter {
            key,
            receiver,
            registry: self.registry.clone(),
        }
    }

    /// Register interest in a packet of a specific type, optionally carrying a specific packet
    /// identifier.
    pub fn register_response(&self, kind: MessageType, packet_id: Option<u16>) -> PacketAwaiter {
        self.register(move |packet| {
            packet.message_type() == kind
                && (packet_id.is_none() || packet.packet_id() == packet_id)
        })
    }

    /// Complete the first awaiter matching the packet.
    ///
    /// # Returns
    /// The packet if no awaiter accepted it.
    pub fn try_dispatch(&self, packet: Packet) -> Option<Packet> {
        let mut registry = self.registry.lock();
        let mut packet = packet;

        loop {
            let Some(index) = registry
                .awaiters
                .iter()
                .position(|registration| (registration.predicate)(&packet))
            else {
                return Some(packet);
            };

            let registration = registry.awaiters.remove(index);
            match registration.slot.send(Ok(packet)) {
                Ok(()) => return None,

                // The awaiter was abandoned before it could deregister.
                Err(Ok(returned)) => packet = returned,
                Err(Err(_)) => return None,
            }
        }
    }

    /// Fail every registered awaiter with a disconnection outcome.
    pub fn fail_all(&self) {
        let awaiters = core::mem::take(&mut self.registry.lock().awaiters);
        for registration in awaiters {
            registration
                .slot
                .send(Err(Error::Communication(CommunicationError::Disconnected)))
                .ok();
        }
    }

    /// The number of awaiters still registered.
    pub fn pending(&self) -> usize {
        self.registry.lock().awaiters.len()
    }
}

/// A pending wait for a response packet. Dropping the awaiter deregisters it.
pub struct PacketAwaiter {
    key: u64,
    receiver: oneshot::Receiver<Result<Packet, Error>>,
    registry: Arc<Mutex<Registry>>,
}

impl PacketAwaiter {
    /// Wait for the matching packet.
    ///
    /// # Returns
    /// [Error::TimedOut] if no matching packet arrived within the timeout.
    pub async fn wait(mut self, timeout: Duration) -> Result<Packet, Error> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Communication(CommunicationError::Disconnected)),
            Err(_) => Err(Error::TimedOut),
        }
    }
}

impl Drop for PacketAwaiter {
    fn drop(&mut self) {
        let key = self.key;
        self.registry
            .lock()
            .awaiters
            .retain(|registration| registration.key != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{PubResponse, Publish};

    #[tokio::test]
    async fn completes_matching_awaiter() {
        let dispatcher = PacketDispatcher::new();
        let awaiter = dispatcher.register_response(MessageType::PubAck, Some(5));

        assert!(dispatcher
            .try_dispatch(Packet::PubAck(PubResponse::new(4)))
            .is_some());
        assert!(dispatcher
            .try_dispatch(Packet::PubAck(PubResponse::new(5)))
            .is_none());

        let packet = awaiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet, Packet::PubAck(PubResponse::new(5)));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn unmatched_packets_are_returned() {
        let dispatcher = PacketDispatcher::new();
        let _awaiter = dispatcher.register_response(MessageType::PingResp, None);

        let publish = Packet::Publish(Publish::new("topic", "data"));
        assert_eq!(dispatcher.try_dispatch(publish.clone()), Some(publish));
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_deregisters() {
        let dispatcher = PacketDispatcher::new();
        let awaiter = dispatcher.register_response(MessageType::PingResp, None);

        let result = awaiter.wait(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::TimedOut)));
        assert_eq!(dispatcher.pending(), 0);
        assert!(dispatcher.try_dispatch(Packet::PingResp).is_some());
    }

    #[tokio::test]
    async fn disconnect_fails_awaiters() {
        let dispatcher = PacketDispatcher::new();
        let first = dispatcher.register_response(MessageType::SubAck, Some(1));
        let second = dispatcher.register_response(MessageType::UnsubAck, Some(2));

        dispatcher.fail_all();

        for awaiter in [first, second] {
            assert!(matches!(
                awaiter.wait(Duration::from_secs(1)).await,
                Err(Error::Communication(CommunicationError::Disconnected))
            ));
        }
    }

    #[tokio::test]
    async fn abandoned_awaiter_is_skipped() {
        let dispatcher = PacketDispatcher::new();
        let abandoned = dispatcher.register_response(MessageType::PingResp, None);
        let waiting = dispatcher.register_response(MessageType::PingResp, None);
        drop(abandoned);

        assert!(dispatcher.try_dispatch(Packet::PingResp).is_none());
        assert!(waiting.wait(Duration::from_secs(1)).await.is_ok());
    }
}
