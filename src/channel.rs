//! Framed packet exchange over a [Transport].
use crate::{
    codec,
    de::PacketReader,
    design_parameters::READ_CHUNK_SIZE,
    logging::Logger,
    message_types::MessageType,
    packets::Packet,
    transport::Transport,
    CommunicationError, Error, ProtocolError, ProtocolVersion,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// The largest packet MQTT can frame: a 4 byte remaining length of 268,435,455 plus its header.
pub(crate) const MAXIMUM_PACKET_SIZE: usize = 268_435_455 + 5;

struct Limits {
    version: ProtocolVersion,
    maximum_outgoing: usize,
}

/// Sends and receives whole packets over a transport.
///
/// Receiving is performed by a single task. Sending may happen from any number of tasks: every
/// packet is serialized first and written while holding the write gate, so packets are never
/// interleaved on the stream.
pub(crate) struct PacketChannel {
    transport: Arc<dyn Transport>,
    reader: tokio::sync::Mutex<PacketReader>,
    write_gate: tokio::sync::Mutex<()>,
    limits: Mutex<Limits>,
    last_write: Mutex<Instant>,
    last_read: Mutex<Instant>,
    log: Logger,
}

impl PacketChannel {
    pub fn new(transport: Arc<dyn Transport>, version: ProtocolVersion, log: Logger) -> Self {
        Self {
            transport,
            reader: tokio::sync::Mutex::new(PacketReader::new(MAXIMUM_PACKET_SIZE)),
            write_gate: tokio::sync::Mutex::new(()),
            limits: Mutex::new(Limits {
                version,
                maximum_outgoing: MAXIMUM_PACKET_SIZE,
            }),
            last_write: Mutex::new(Instant::now()),
            last_read: Mutex::new(Instant::now()),
            log,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn version(&self) -> ProtocolVersion {
        self.limits.lock().version
    }

    pub fn set_version(&self, version: ProtocolVersion) {
        self.limits.lock().version = version;
    }

    /// Limit the size of packets sent to the peer.
    pub fn set_maximum_outgoing_packet_size(&self, size: Option<u32>) {
        self.limits.lock().maximum_outgoing = size.map_or(MAXIMUM_PACKET_SIZE, |size| size as usize);
    }

    /// Limit the size of packets accepted from the peer.
    pub async fn set_maximum_incoming_packet_size(&self, size: Option<u32>) {
        self.reader
            .lock()
            .await
            .set_maximum_packet_size(size.map_or(MAXIMUM_PACKET_SIZE, |size| size as usize));
    }

    /// Drop any partially received data, e.g. before reusing the channel for a new connection.
    pub async fn reset(&self) {
        self.reader.lock().await.reset();
        *self.last_read.lock() = Instant::now();
        *self.last_write.lock() = Instant::now();
    }

    /// The time of the last completed packet write.
    pub fn last_write(&self) -> Instant {
        *self.last_write.lock()
    }

    /// The time of the last received packet.
    pub fn last_read(&self) -> Instant {
        *self.last_read.lock()
    }

    /// Serialize and transmit a packet.
    pub async fn send(&self, packet: &Packet) -> Result<(), Error> {
        let (version, maximum) = {
            let limits = self.limits.lock();
            (limits.version, limits.maximum_outgoing)
        };

        let data = codec::encode(packet, version)?;
        if data.len() > maximum {
            self.log.warn(format_args!(
                "Cannot send {:?} of {} bytes, the peer accepts at most {}",
                packet.message_type(),
                data.len(),
                maximum
            ));
            return Err(ProtocolError::PacketTooLarge.into());
        }

        let _gate = self.write_gate.lock().await;
        self.log
            .trace(format_args!("Sending {:?}", packet.message_type()));
        self.transport.write(&data).await?;
        *self.last_write.lock() = Instant::now();
        Ok(())
    }

    /// Receive the next complete packet.
    ///
    /// The first CONNECT received determines the protocol revision of the channel.
    ///
    /// # Note
    /// This is cancel safe: buffered data is retained if the future is dropped.
    pub async fn receive(&self) -> Result<Packet, Error> {
        let mut reader = self.reader.lock().await;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some((header, body)) = reader.pop_packet()? {
                let version = if header.message_type == MessageType::Connect {
                    let version = codec::detect_version(&body)?;
                    self.set_version(version);
                    version
                } else {
                    self.version()
                };

                let packet = codec::decode(&header, &body, version)?;
                *self.last_read.lock() = Instant::now();
                self.log
                    .trace(format_args!("Received {:?}", packet.message_type()));
                return Ok(packet);
            }

            let received = self.transport.read(&mut chunk).await?;
            if received == 0 {
                return Err(CommunicationError::Closed.into());
            }

            reader.fill(&chunk[..received]);
        }
    }

    pub async fn close(&self) {
        let _gate = self.write_gate.lock().await;
        if let Err(error) = self.transport.disconnect().await {
            self.log
                .debug(format_args!("Transport disconnect failed: {}", error));
        }
    }
}
