//! MQTT stream client against a local broker

use std::time::Duration;
use symbion_devkit::{wait_until, BrokerPacket, FakeBroker};
use symbion_throttle::config::{BrokerConfig, StreamConfig};
use symbion_throttle::consumer::mqtt::MqttStreamClient;
use symbion_throttle::consumer::StreamClient;
use symbion_throttle::error::StreamError;

const WAIT: Duration = Duration::from_secs(3);
/// Lets SUBACK/UNSUBACK land before the socket is cut
const SETTLE: Duration = Duration::from_millis(100);

fn broker_config(broker: &FakeBroker) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: broker.port(),
        keep_alive_secs: 1,
        reconnect_delay_secs: 0,
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn test_keep_alive_continues_while_inbox_is_full() {
    let broker = FakeBroker::start().await.unwrap();
    let stream = StreamConfig {
        inbox_capacity: 2,
        ..StreamConfig::default()
    };
    let mut client = MqttStreamClient::connect("throttle-keepalive", &broker_config(&broker), &stream);
    client.subscribe("jobs").await.unwrap();
    assert!(wait_until(WAIT, || broker.subscribes("jobs") == 1).await);

    for n in 0..10 {
        assert!(broker.publish("jobs", format!("job-{n}").as_bytes(), true));
    }

    // Nobody reads: only what fits in the inbox is acknowledged
    assert!(wait_until(WAIT, || broker.pubacks() == 2).await);
    let pings = broker.pings();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(broker.pings() > pings, "no PINGREQ while the consumer was idle");
    assert_eq!(broker.pubacks(), 2);

    for n in 0..10 {
        let message = client.receive(WAIT).await.unwrap().expect("message");
        assert_eq!(message.topic, "jobs");
        assert_eq!(message.payload, format!("job-{n}").into_bytes());
    }
    assert!(wait_until(WAIT, || broker.pubacks() == 10).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_pause_resume_and_resubscribe_after_reconnect() {
    let broker = FakeBroker::start().await.unwrap();
    let mut client =
        MqttStreamClient::connect("throttle-resubscribe", &broker_config(&broker), &StreamConfig::default());

    client.subscribe("jobs").await.unwrap();
    assert!(wait_until(WAIT, || broker.subscribes("jobs") == 1).await);
    tokio::time::sleep(SETTLE).await;

    // Reconnect while subscribed replays the subscription
    broker.drop_connection();
    assert!(matches!(
        client.receive(WAIT).await,
        Err(StreamError::Transient(_))
    ));
    assert!(wait_until(WAIT, || broker.connects() == 2 && broker.subscribes("jobs") == 2).await);
    tokio::time::sleep(SETTLE).await;

    client.pause_assigned().await.unwrap();
    assert!(wait_until(WAIT, || broker.unsubscribes("jobs") == 1).await);
    tokio::time::sleep(SETTLE).await;

    // Reconnect while paused does not
    broker.drop_connection();
    assert!(wait_until(WAIT, || broker.connects() == 3).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.subscribes("jobs"), 2);

    client.resume_assigned().await.unwrap();
    assert!(wait_until(WAIT, || broker.subscribes("jobs") == 3).await);

    assert!(broker.publish("jobs", b"after-resume", false));
    let message = loop {
        // Skip transient reports left over from the reconnects
        match client.receive(WAIT).await {
            Err(StreamError::Transient(_)) => continue,
            other => break other.unwrap().expect("message"),
        }
    };
    assert_eq!(message.payload, b"after-resume".to_vec());

    client.close().await.unwrap();
    assert!(wait_until(WAIT, || broker.count(|p| *p == BrokerPacket::Disconnect) == 1).await);
}

#[tokio::test]
async fn test_pause_before_subscribe_is_fatal() {
    let broker = FakeBroker::start().await.unwrap();
    let mut client =
        MqttStreamClient::connect("throttle-unsubscribed", &broker_config(&broker), &StreamConfig::default());

    assert!(matches!(client.pause_assigned().await, Err(StreamError::Fatal(_))));
    assert!(matches!(client.resume_assigned().await, Err(StreamError::Fatal(_))));
    client.close().await.unwrap();
}
