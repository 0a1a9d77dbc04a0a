use crate::aggregate::UtilizationSignal;
use crate::config::{BrokerConfig, StatusConfig};
use crate::consumer::ConsumerStatus;
use crate::policy::ThrottleDecision;
use crate::pool::ConsumerPool;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

/// Published on the status topic
#[derive(Debug, Serialize)]
pub struct ControllerStatus {
    pub uptime_seconds: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_failures: u32,
    pub last_signal: Option<f64>,
    pub last_decision: Option<String>,
    pub consumers: Vec<ConsumerSnapshot>,
    pub mqtt_reconnects: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConsumerSnapshot {
    pub id: u32,
    pub status: ConsumerStatus,
    pub poll_interval_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct LastTick {
    signal: Option<f64>,
    decision: Option<ThrottleDecision>,
}

/// Counters written by the control loop, read by the publisher
#[derive(Clone)]
pub struct StatusTracker {
    start_time: Instant,
    ticks: Arc<AtomicU64>,
    failed_ticks: Arc<AtomicU64>,
    consecutive_failures: Arc<AtomicU32>,
    mqtt_reconnects: Arc<AtomicU32>,
    last: Arc<Mutex<LastTick>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ticks: Arc::new(AtomicU64::new(0)),
            failed_ticks: Arc::new(AtomicU64::new(0)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            last: Arc::new(Mutex::new(LastTick::default())),
        }
    }

    pub fn record_tick(&self, signal: UtilizationSignal, decision: ThrottleDecision) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut last = self.last.lock();
        last.signal = Some(signal.value());
        last.decision = Some(decision);
    }

    pub fn record_failure(&self, consecutive: u32) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.failed_ticks.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(consecutive, Ordering::Relaxed);
    }

    /// A fallback decision applied without a fresh signal
    pub fn record_decision(&self, decision: ThrottleDecision) {
        self.last.lock().decision = Some(decision);
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn failed_ticks(&self) -> u64 {
        self.failed_ticks.load(Ordering::Relaxed)
    }

    pub fn last_decision(&self) -> Option<ThrottleDecision> {
        self.last.lock().decision
    }

    pub fn snapshot(&self, pool: &ConsumerPool) -> ControllerStatus {
        let (last_signal, last_decision) = {
            let last = self.last.lock();
            (last.signal, last.decision.map(|d| d.to_string()))
        };
        let consumers = pool
            .states()
            .into_iter()
            .map(|state| ConsumerSnapshot {
                id: state.id,
                status: state.status,
                poll_interval_ms: state.poll_interval.as_millis() as u64,
                last_error: state.last_error.map(|e| e.to_string()),
            })
            .collect();

        ControllerStatus {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            ticks: self.ticks(),
            failed_ticks: self.failed_ticks(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_signal,
            last_decision,
            consumers,
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

/// Publish the controller status periodically on its own MQTT connection
pub fn spawn_status_publisher(
    tracker: StatusTracker,
    pool: Arc<ConsumerPool>,
    broker: &BrokerConfig,
    config: &StatusConfig,
) -> JoinHandle<()> {
    let client_id = format!("{}-status-{}", broker.client_id_prefix, uuid::Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, &broker.host, broker.port);
    opts.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));

    let topic = config.topic.clone();
    let period = Duration::from_secs(config.interval_secs);
    let reconnect_delay = Duration::from_secs(broker.reconnect_delay_secs);

    task::spawn(async move {
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let status = tracker.snapshot(&pool);
                    match serde_json::to_string(&status) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                                warn!("Failed to publish status: {}", e);
                            } else {
                                debug!(ticks = status.ticks, "Published controller status");
                            }
                        }
                        Err(e) => warn!("Failed to serialize status: {}", e),
                    }
                },
                event = eventloop.poll() => {
                    if let Err(e) = event {
                        warn!("Status MQTT error: {}", e);
                        tracker.increment_reconnects();
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let tracker = StatusTracker::new();
        tracker.record_tick(UtilizationSignal::new(42.0), ThrottleDecision::Resume);
        tracker.record_failure(1);
        tracker.record_failure(2);

        let status = tracker.snapshot(&ConsumerPool::new());
        assert_eq!(status.ticks, 3);
        assert_eq!(status.failed_ticks, 2);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_signal, Some(42.0));
        assert_eq!(status.last_decision.as_deref(), Some("resume"));
        assert!(status.consumers.is_empty());

        tracker.record_tick(UtilizationSignal::new(80.0), ThrottleDecision::Pause);
        let status = tracker.snapshot(&ConsumerPool::new());
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(tracker.last_decision(), Some(ThrottleDecision::Pause));
    }

    #[test]
    fn test_status_serializes() {
        let tracker = StatusTracker::new();
        tracker.record_decision(ThrottleDecision::Throttle(Duration::from_secs(60)));
        let json = serde_json::to_value(tracker.snapshot(&ConsumerPool::new())).unwrap();
        assert_eq!(json["last_decision"], "throttle(60000ms)");
        assert_eq!(json["ticks"], 0);
        assert!(json["last_signal"].is_null());
    }
}
