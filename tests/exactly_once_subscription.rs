use omnimq::{
    packets::{Connect, PubResponse, Publish},
    types::{SubscriptionOptions, TopicSubscription},
    BrokerOptions, ClientOptions, MqttBroker, Packet, Publication, ProtocolVersion, QoS,
    ReasonCode,
};
use std::time::Duration;

mod stack;

#[tokio::test]
async fn repeated_publication_is_delivered_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    let subscriber = stack::client(&broker, ClientOptions::new("subscriber"));
    let inbox = stack::inbox(&subscriber);
    subscriber.connect().await.unwrap();
    let granted = subscriber
        .subscribe(
            &[TopicSubscription::new(
                "data",
                SubscriptionOptions::new(QoS::ExactlyOnce),
            )],
            &[],
        )
        .await
        .unwrap();
    assert_eq!(granted, vec![ReasonCode::GrantedQos2]);

    let mut publisher = stack::RawPeer::attach(&broker, ProtocolVersion::V500);
    publisher
        .connect(Connect::new("publisher", ProtocolVersion::V500))
        .await;

    let mut publish = Publish::new("data", "Ping");
    publish.qos = QoS::ExactlyOnce;
    publish.packet_id = Some(3);
    publisher.send(Packet::Publish(publish.clone())).await;
    assert_eq!(publisher.receive().await, Packet::PubRec(PubResponse::new(3)));

    publish.dup = true;
    publisher.send(Packet::Publish(publish.clone())).await;
    assert_eq!(publisher.receive().await, Packet::PubRec(PubResponse::new(3)));

    // Nothing is released before PUBREL.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbox.lock().is_empty());

    publisher.send(Packet::PubRel(PubResponse::new(3))).await;
    assert_eq!(publisher.receive().await, Packet::PubComp(PubResponse::new(3)));

    // A PUBREL repeated after the exchange completed is still acknowledged.
    publisher.send(Packet::PubRel(PubResponse::new(3))).await;
    assert!(matches!(publisher.receive().await, Packet::PubComp(comp) if comp.packet_id == 3));

    // A duplicate arriving after completion is acknowledged but not routed again.
    publisher.send(Packet::Publish(publish)).await;
    assert_eq!(publisher.receive().await, Packet::PubRec(PubResponse::new(3)));

    assert!(stack::eventually(|| inbox.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(inbox.lock().len(), 1);
    assert_eq!(inbox.lock()[0].qos, QoS::ExactlyOnce);
}

#[tokio::test]
async fn end_to_end_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    let subscriber = stack::client(&broker, ClientOptions::new("subscriber"));
    let inbox = stack::inbox(&subscriber);
    subscriber.connect().await.unwrap();
    subscriber
        .subscribe(
            &[TopicSubscription::new(
                "data/+",
                SubscriptionOptions::new(QoS::ExactlyOnce),
            )],
            &[],
        )
        .await
        .unwrap();

    let publisher = stack::client(&broker, ClientOptions::new("publisher"));
    publisher.connect().await.unwrap();

    for index in 0..5 {
        let message = Publication::new(format!("{}", index))
            .topic(format!("data/{}", index))
            .qos(QoS::ExactlyOnce)
            .finish()
            .unwrap();
        publisher.publish(message).await.unwrap();
    }
    assert_eq!(publisher.pending_messages(), 0);

    assert!(stack::eventually(|| inbox.lock().len() == 5).await);
    let inbox = inbox.lock();
    for (index, message) in inbox.iter().enumerate() {
        assert_eq!(message.topic, format!("data/{}", index));
        assert_eq!(message.payload, format!("{}", index).into_bytes());
    }
}
