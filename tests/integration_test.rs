use omnimq::{
    events::ClientEvent,
    types::{SubscriptionOptions, TopicSubscription},
    BrokerOptions, ClientOptions, MqttBroker, MqttClient, Publication, ProtocolVersion, QoS,
    ReasonCode, TcpTransport,
};
use std::sync::Arc;
use tokio::net::TcpListener;

mod stack;

async fn connected(address: &str, client_id: &str, version: ProtocolVersion) -> MqttClient {
    let options = ClientOptions::new(client_id).protocol_version(version);
    let client = MqttClient::new(TcpTransport::new(address), options);
    let ack = client.connect().await.unwrap();
    assert_eq!(ack.reason_code, ReasonCode::Success);
    client
}

#[tokio::test]
async fn mixed_protocol_versions() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let broker = Arc::new(MqttBroker::new(BrokerOptions::default()));
    let server = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve(listener).await })
    };

    let legacy = connected(&address, "legacy", ProtocolVersion::V310).await;
    let inbox = stack::inbox(&legacy);
    let granted = legacy
        .subscribe(
            &[
                TopicSubscription::new("sensors/+/temperature", SubscriptionOptions::new(QoS::ExactlyOnce)),
                TopicSubscription::new("sensors/#", SubscriptionOptions::new(QoS::AtMostOnce)),
            ],
            &[],
        )
        .await
        .unwrap();
    assert_eq!(granted, vec![ReasonCode::GrantedQos2, ReasonCode::Success]);

    let current = connected(&address, "current", ProtocolVersion::V311).await;
    let modern = connected(&address, "modern", ProtocolVersion::V500).await;

    current
        .publish(
            Publication::new("21.5")
                .topic("sensors/kitchen/temperature")
                .qos(QoS::AtLeastOnce)
                .finish()
                .unwrap(),
        )
        .await
        .unwrap();
    modern
        .publish(
            Publication::new("48")
                .topic("sensors/kitchen/humidity")
                .qos(QoS::ExactlyOnce)
                .finish()
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(stack::eventually(|| inbox.lock().len() == 2).await);
    {
        let inbox = inbox.lock();
        // Overlapping subscriptions deliver once, at the highest granted QoS.
        assert_eq!(inbox[0].topic, "sensors/kitchen/temperature");
        assert_eq!(inbox[0].qos, QoS::AtLeastOnce);
        assert_eq!(inbox[1].topic, "sensors/kitchen/humidity");
        assert_eq!(inbox[1].qos, QoS::AtMostOnce);
    }

    let mut status = broker.session_status();
    status.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    assert_eq!(status.len(), 3);
    assert!(status.iter().all(|session| session.connected));

    // Stopping the broker disconnects every client.
    let disconnected = Arc::new(parking_lot::Mutex::new(None));
    let reason = disconnected.clone();
    modern.events().add(move |event| {
        if let ClientEvent::Disconnected { reason: code, .. } = event {
            *reason.lock() = Some(*code);
        }
    });

    broker.stop();
    server.await.unwrap().unwrap();
    assert!(stack::eventually(|| !legacy.is_connected() && !current.is_connected()).await);
    assert!(stack::eventually(|| disconnected.lock().is_some()).await);
    assert_eq!(
        *disconnected.lock(),
        Some(Some(ReasonCode::ServerShuttingDown))
    );
}
