//! MQTT implementation of the stream client
//!
//! - One connection per consumer, each with its own event loop pump task
//! - Consumer groups map to shared subscriptions (`$share/{group}/{topic}`)
//! - Pause unsubscribes; the pump keeps the session alive meanwhile
//! - Subscriptions are replayed after a reconnect unless paused
//!
//! The pump never waits on the consumer. Publishes go to a forwarder task
//! that moves them into the bounded inbox and acks each one once it is
//! there, so an idle consumer holds back the broker (through its inflight
//! window) without starving keep-alive.

use super::{StreamClient, StreamMessage};
use crate::config::{BrokerConfig, StreamConfig};
use crate::error::StreamError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, Publish, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Delivery = Result<StreamMessage, StreamError>;

/// Pump to forwarder, in arrival order
enum Forward {
    Publish(Publish),
    Fatal(StreamError),
}

/// Grace given to the pump to flush the DISCONNECT packet
const CLOSE_GRACE: Duration = Duration::from_millis(500);

pub struct MqttStreamClient {
    client: AsyncClient,
    inbox: mpsc::Receiver<Delivery>,
    pump: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    qos: QoS,
    topic: Option<String>,
    /// Topic to replay after a reconnect; None while paused or closed
    wanted: Arc<Mutex<Option<String>>>,
    closed: bool,
}

impl MqttStreamClient {
    /// Open a connection for one consumer. The broker is contacted lazily by the pump.
    pub fn connect(client_id: &str, broker: &BrokerConfig, stream: &StreamConfig) -> Self {
        let mut mqtt_options = MqttOptions::new(client_id, &broker.host, broker.port);
        mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
        mqtt_options.set_clean_session(broker.clean_session);
        mqtt_options.set_manual_acks(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
        let (tx, inbox) = mpsc::channel(stream.inbox_capacity);
        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        let qos = qos_from_level(stream.qos);
        let wanted = Arc::new(Mutex::new(None));
        let connected_once = Arc::new(AtomicBool::new(false));

        let forwarder = tokio::spawn(forward_deliveries(
            client_id.to_string(),
            client.clone(),
            backlog_rx,
            tx.clone(),
        ));
        let pump = tokio::spawn(pump_events(
            client_id.to_string(),
            eventloop,
            client.clone(),
            backlog_tx,
            tx,
            Arc::clone(&wanted),
            connected_once,
            qos,
            Duration::from_secs(broker.reconnect_delay_secs),
        ));

        Self {
            client,
            inbox,
            pump,
            forwarder,
            qos,
            topic: None,
            wanted,
            closed: false,
        }
    }

    fn topic(&self) -> Result<&str, StreamError> {
        self.topic
            .as_deref()
            .ok_or_else(|| StreamError::Fatal("no subscription".to_string()))
    }
}

#[async_trait]
impl StreamClient for MqttStreamClient {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StreamError> {
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(client_error)?;
        self.topic = Some(topic.to_string());
        *self.wanted.lock() = Some(topic.to_string());
        Ok(())
    }

    async fn pause_assigned(&mut self) -> Result<(), StreamError> {
        let topic = self.topic()?.to_string();
        *self.wanted.lock() = None;
        self.client.unsubscribe(&topic).await.map_err(client_error)
    }

    async fn resume_assigned(&mut self) -> Result<(), StreamError> {
        let topic = self.topic()?.to_string();
        *self.wanted.lock() = Some(topic.clone());
        self.client.subscribe(&topic, self.qos).await.map_err(client_error)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, StreamError> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(delivery)) => delivery.map(Some),
            Ok(None) => Err(StreamError::Fatal("MQTT event loop terminated".to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        *self.wanted.lock() = None;

        let result = self.client.disconnect().await.map_err(client_error);
        self.inbox.close();
        if tokio::time::timeout(CLOSE_GRACE, &mut self.pump).await.is_err() {
            self.pump.abort();
        }
        self.forwarder.abort();
        result
    }
}

impl Drop for MqttStreamClient {
    fn drop(&mut self) {
        self.pump.abort();
        self.forwarder.abort();
    }
}

/// Drive the event loop. Never awaits the consumer, so keep-alive pings
/// go out while the inbox is full.
#[allow(clippy::too_many_arguments)]
async fn pump_events(
    client_id: String,
    mut eventloop: EventLoop,
    client: AsyncClient,
    backlog: mpsc::UnboundedSender<Forward>,
    inbox: mpsc::Sender<Delivery>,
    wanted: Arc<Mutex<Option<String>>>,
    connected_once: Arc<AtomicBool>,
    qos: QoS,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if backlog.send(Forward::Publish(publish)).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // The initial SUBSCRIBE is already queued; later CONNACKs follow a reconnect
                if connected_once.swap(true, Ordering::Relaxed) {
                    let topic = wanted.lock().clone();
                    if let Some(topic) = topic {
                        debug!(client = %client_id, topic = %topic, "Re-subscribing after reconnect");
                        if let Err(e) = client.try_subscribe(topic, qos) {
                            warn!(client = %client_id, "Re-subscribe failed: {}", e);
                        }
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if is_fatal(&e) {
                    error!(client = %client_id, "MQTT connection refused: {}", e);
                    // Queued behind pending publishes
                    let _ = backlog.send(Forward::Fatal(StreamError::Fatal(e.to_string())));
                    break;
                }
                warn!(client = %client_id, "MQTT connection error: {}", e);
                // Advisory only; dropped when the inbox is full
                let _ = inbox.try_send(Err(StreamError::Transient(e.to_string())));
                if inbox.is_closed() {
                    break;
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    debug!(client = %client_id, "MQTT pump finished");
}

/// Move publishes into the inbox as the consumer makes room, acking each once queued
async fn forward_deliveries(
    client_id: String,
    client: AsyncClient,
    mut backlog: mpsc::UnboundedReceiver<Forward>,
    inbox: mpsc::Sender<Delivery>,
) {
    while let Some(item) = backlog.recv().await {
        match item {
            Forward::Publish(publish) => {
                let message = StreamMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if inbox.send(Ok(message)).await.is_err() {
                    break;
                }
                if let Err(e) = client.ack(&publish).await {
                    debug!(client = %client_id, "Ack not sent: {}", e);
                    break;
                }
            }
            Forward::Fatal(error) => {
                let _ = inbox.send(Err(error)).await;
                break;
            }
        }
    }
    debug!(client = %client_id, "MQTT forwarder finished");
}

fn is_fatal(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::RefusedProtocolVersion
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
        )
    )
}

/// Request channel to the event loop is gone; the client cannot recover
fn client_error(error: ClientError) -> StreamError {
    StreamError::Fatal(error.to_string())
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_refused_connections_are_fatal() {
        assert!(is_fatal(&ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)));
        assert!(is_fatal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_fatal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        assert!(!is_fatal(&ConnectionError::NetworkTimeout));
    }

    #[tokio::test]
    async fn test_receive_times_out_without_broker() {
        let broker = BrokerConfig {
            port: 1,
            reconnect_delay_secs: 60,
            ..BrokerConfig::default()
        };
        let mut client = MqttStreamClient::connect("symbion-throttle-test", &broker, &StreamConfig::default());

        // Connection errors surface as transient, never as messages
        let received = client.receive(Duration::from_millis(300)).await;
        assert!(matches!(received, Ok(None) | Err(StreamError::Transient(_))));

        client.close().await.ok();
        assert!(client.close().await.is_ok());
    }
}
