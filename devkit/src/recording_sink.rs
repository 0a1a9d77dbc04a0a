/*!
Message sink that records deliveries for assertions
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use symbion_throttle::consumer::{MessageSink, StreamMessage};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_id: u32,
    pub message: StreamMessage,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn count_for(&self, consumer_id: u32) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.consumer_id == consumer_id)
            .count()
    }

    /// Delivery instants for one consumer, oldest first
    pub fn times_for(&self, consumer_id: u32) -> Vec<Instant> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.consumer_id == consumer_id)
            .map(|d| d.at)
            .collect()
    }

    /// Wait until at least `count` messages arrived. False on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        crate::test_utils::wait_until(timeout, || self.count() >= count).await
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, consumer_id: u32, message: StreamMessage) {
        log::debug!("📨 [SINK] consumer {} got {}", consumer_id, message.topic);
        self.deliveries.lock().push(Delivery {
            consumer_id,
            message,
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::job_message;

    #[tokio::test]
    async fn test_records_per_consumer() {
        let sink = RecordingSink::new();
        sink.deliver(1, job_message("jobs", "a")).await;
        sink.deliver(2, job_message("jobs", "b")).await;
        sink.deliver(1, job_message("jobs", "c")).await;

        assert_eq!(sink.count(), 3);
        assert_eq!(sink.count_for(1), 2);
        assert_eq!(sink.times_for(2).len(), 1);
        assert!(sink.wait_for(3, Duration::from_millis(10)).await);
        assert!(!sink.wait_for(4, Duration::from_millis(30)).await);
    }
}
