use omnimq::{
    packets::{Connect, Disconnect},
    types::{SubscriptionOptions, TopicSubscription},
    BrokerOptions, ClientOptions, MqttBroker, MqttClient, Packet, Property, ProtocolVersion, QoS,
    ReasonCode, Will,
};
use std::time::Duration;

mod stack;

async fn observer(broker: &MqttBroker) -> (MqttClient, stack::Inbox) {
    let client = stack::client(broker, ClientOptions::new("observer"));
    let inbox = stack::inbox(&client);
    client.connect().await.unwrap();
    client
        .subscribe(
            &[TopicSubscription::new(
                "status/#",
                SubscriptionOptions::new(QoS::AtLeastOnce),
            )],
            &[],
        )
        .await
        .unwrap();
    (client, inbox)
}

fn with_will(client_id: &str, version: ProtocolVersion, properties: &[Property]) -> Connect {
    let mut connect = Connect::new(client_id, version);
    connect.will = Some(
        Will::new(format!("status/{}", client_id), "offline", properties)
            .unwrap()
            .qos(QoS::AtLeastOnce),
    );
    connect
}

#[tokio::test]
async fn will_follows_abnormal_disconnection() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    let (_observer, inbox) = observer(&broker).await;

    // A graceful DISCONNECT discards the will.
    let mut graceful = stack::RawPeer::attach(&broker, ProtocolVersion::V311);
    graceful
        .connect(with_will("graceful", ProtocolVersion::V311, &[]))
        .await;
    graceful
        .send(Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
        .await;

    // A lost connection publishes it.
    let mut lost = stack::RawPeer::attach(&broker, ProtocolVersion::V311);
    lost.connect(with_will("lost", ProtocolVersion::V311, &[]))
        .await;
    drop(lost);

    // MQTT v5 clients may ask for their will explicitly.
    let mut requested = stack::RawPeer::attach(&broker, ProtocolVersion::V500);
    requested
        .connect(with_will("requested", ProtocolVersion::V500, &[]))
        .await;
    requested
        .send(Packet::Disconnect(Disconnect::new(
            ReasonCode::DisconnectWithWill,
        )))
        .await;

    assert!(stack::eventually(|| inbox.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut topics: Vec<String> = inbox.lock().iter().map(|m| m.topic.clone()).collect();
    topics.sort();
    assert_eq!(topics, vec!["status/lost", "status/requested"]);
    assert!(inbox.lock().iter().all(|m| &m.payload[..] == b"offline"));
}

#[tokio::test]
async fn delayed_will_is_cancelled_by_reconnection() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    let (_observer, inbox) = observer(&broker).await;

    let connect = || {
        let mut connect = with_will(
            "delayed",
            ProtocolVersion::V500,
            &[Property::WillDelayInterval(1)],
        );
        connect.clean_session = false;
        connect.properties = vec![Property::SessionExpiryInterval(60)];
        connect
    };

    let mut peer = stack::RawPeer::attach(&broker, ProtocolVersion::V500);
    peer.connect(connect()).await;
    drop(peer);

    // Back before the delay elapsed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut peer = stack::RawPeer::attach(&broker, ProtocolVersion::V500);
    assert!(peer.connect(connect()).await.session_present);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(inbox.lock().is_empty());

    drop(peer);
    assert!(stack::eventually(|| inbox.lock().len() == 1).await);
    assert_eq!(inbox.lock()[0].topic, "status/delayed");
}
