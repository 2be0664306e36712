use omnimq::{
    events::BrokerEvent,
    retained::RetainedChange,
    types::{RetainHandling, SubscriptionOptions, TopicSubscription},
    BrokerOptions, ClientOptions, MqttBroker, Publication, QoS,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

mod stack;

fn retained(topic: &str, payload: &str) -> omnimq::ApplicationMessage {
    Publication::new(payload.to_string())
        .topic(topic)
        .qos(QoS::AtLeastOnce)
        .retain()
        .finish()
        .unwrap()
}

#[tokio::test]
async fn retained_message_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let log = changes.clone();
    broker.events().add(move |event| {
        if let BrokerEvent::RetainedMessageChanged { topic, change } = event {
            log.lock().push((topic.clone(), *change));
        }
    });

    let publisher = stack::client(&broker, ClientOptions::new("publisher"));
    publisher.connect().await.unwrap();
    publisher
        .publish(retained("status/boiler", "on"))
        .await
        .unwrap();

    let first = stack::client(&broker, ClientOptions::new("first"));
    let inbox = stack::inbox(&first);
    first.connect().await.unwrap();
    first
        .subscribe(
            &[TopicSubscription::new(
                "status/#",
                SubscriptionOptions::new(QoS::AtLeastOnce),
            )],
            &[],
        )
        .await
        .unwrap();

    assert!(stack::eventually(|| inbox.lock().len() == 1).await);
    {
        let inbox = inbox.lock();
        assert_eq!(inbox[0].topic, "status/boiler");
        assert_eq!(&inbox[0].payload[..], b"on");
        assert!(inbox[0].retain);
    }

    // An empty retained payload clears the topic.
    publisher.publish(retained("status/boiler", "")).await.unwrap();
    assert!(broker.retained_messages().is_empty());

    let second = stack::client(&broker, ClientOptions::new("second"));
    let late = stack::inbox(&second);
    second.connect().await.unwrap();
    second
        .subscribe(
            &[TopicSubscription::new(
                "status/#",
                SubscriptionOptions::new(QoS::AtLeastOnce),
            )],
            &[],
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(late.lock().is_empty());

    assert_eq!(
        *changes.lock(),
        vec![
            ("status/boiler".to_string(), RetainedChange::Added),
            ("status/boiler".to_string(), RetainedChange::Removed),
        ]
    );
}

#[tokio::test]
async fn retain_handling_options() {
    let _ = env_logger::builder().is_test(true).try_init();

    let broker = MqttBroker::new(BrokerOptions::default());
    broker.publish(retained("a/b", "kept")).unwrap();

    let client = stack::client(&broker, ClientOptions::new("client"));
    let inbox = stack::inbox(&client);
    client.connect().await.unwrap();

    let skip = TopicSubscription::new(
        "a/+",
        SubscriptionOptions::new(QoS::AtMostOnce).retain_handling(RetainHandling::DoNotSend),
    );
    client.subscribe(&[skip], &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbox.lock().is_empty());

    // The subscription exists already, so nothing is sent.
    let if_new = TopicSubscription::new(
        "a/+",
        SubscriptionOptions::new(QoS::AtMostOnce)
            .retain_handling(RetainHandling::SendAtSubscribeIfNew),
    );
    client.subscribe(&[if_new], &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbox.lock().is_empty());

    let always = TopicSubscription::new("a/+", SubscriptionOptions::new(QoS::AtMostOnce));
    client.subscribe(&[always], &[]).await.unwrap();
    assert!(stack::eventually(|| inbox.lock().len() == 1).await);
}
