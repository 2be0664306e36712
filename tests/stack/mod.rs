//! Test fixtures: a raw MQTT peer that exchanges individual packets, and clients attached to an
//! in-process broker over in-memory pipes.
#![allow(dead_code)]

use omnimq::{
    codec,
    de::PacketReader,
    events::ClientEvent,
    packets::{ConnAck, Connect},
    ApplicationMessage, ClientOptions, MqttBroker, MqttClient, Packet, ProtocolVersion,
    StreamTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;

/// The longest a test waits for a packet that must arrive.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// One end of an MQTT connection driven packet by packet.
pub struct RawPeer {
    stream: DuplexStream,
    reader: PacketReader,
    version: ProtocolVersion,
}

impl RawPeer {
    pub fn new(stream: DuplexStream, version: ProtocolVersion) -> Self {
        Self {
            stream,
            reader: PacketReader::new(PIPE_CAPACITY),
            version,
        }
    }

    /// A peer acting as client of `broker`.
    pub fn attach(broker: &MqttBroker, version: ProtocolVersion) -> Self {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        broker.accept(StreamTransport::new(remote));
        Self::new(local, version)
    }

    /// A peer acting as broker for `client`.
    pub fn serve(version: ProtocolVersion, options: ClientOptions) -> (MqttClient, Self) {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let client = MqttClient::new(StreamTransport::new(local), options);
        (client, Self::new(remote, version))
    }

    pub async fn send(&mut self, packet: Packet) {
        let data = codec::encode(&packet, self.version).unwrap();
        self.stream.write_all(&data).await.unwrap();
    }

    /// Receive the next packet. `None` if the other end closed the connection.
    pub async fn next(&mut self) -> Option<Packet> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some((header, body)) = self.reader.pop_packet().unwrap() {
                return Some(codec::decode(&header, &body, self.version).unwrap());
            }

            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(count) => self.reader.fill(&chunk[..count]),
            }
        }
    }

    pub async fn receive(&mut self) -> Packet {
        tokio::time::timeout(PATIENCE, self.next())
            .await
            .expect("no packet received")
            .expect("connection closed")
    }

    /// Wait for `period` and return the packet if one arrived in that time.
    pub async fn receive_within(&mut self, period: Duration) -> Option<Packet> {
        tokio::time::timeout(period, self.next()).await.ok().flatten()
    }

    pub async fn connect(&mut self, connect: Connect) -> ConnAck {
        self.send(Packet::Connect(connect)).await;
        match self.receive().await {
            Packet::ConnAck(ack) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }
}

/// A client of `broker` connected over an in-memory pipe. The client is not connected yet.
pub fn client(broker: &MqttBroker, options: ClientOptions) -> MqttClient {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    broker.accept(StreamTransport::new(remote));
    MqttClient::new(StreamTransport::new(local), options)
}

pub type Inbox = Arc<Mutex<Vec<ApplicationMessage>>>;

/// Record every application message the client receives.
pub fn inbox(client: &MqttClient) -> Inbox {
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let messages = inbox.clone();
    client.events().add(move |event| {
        if let ClientEvent::MessageReceived(message) = event {
            messages.lock().push(message.clone());
        }
    });
    inbox
}

/// Poll `condition` until it holds or [PATIENCE] elapsed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
