//! Stream consumers and the boundary to the message-queue client
//!
//! Each consumer is a [`ConsumerHandle`] owning one receive loop task. The
//! loop talks to the queue only through [`StreamClient`] and hands messages
//! to a [`MessageSink`].

mod handle;
pub mod mqtt;

pub use handle::ConsumerHandle;

use crate::error::StreamError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// One message taken off the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Operations the consumer needs from a message-queue client
#[async_trait]
pub trait StreamClient: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StreamError>;

    /// Stop delivery without giving up the subscription's place in the group
    async fn pause_assigned(&mut self) -> Result<(), StreamError>;

    async fn resume_assigned(&mut self) -> Result<(), StreamError>;

    /// Wait up to `timeout` for one message. `Ok(None)` means the wait timed out.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Downstream processing of received messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, consumer_id: u32, message: StreamMessage);
}

/// Sink that only logs what it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn deliver(&self, consumer_id: u32, message: StreamMessage) {
        info!(
            consumer = consumer_id,
            topic = %message.topic,
            "Received message: {}",
            String::from_utf8_lossy(&message.payload)
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    Active,
    Paused,
    /// Terminal
    Stopped,
}

/// Snapshot of a consumer as seen by other tasks
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerState {
    pub id: u32,
    pub status: ConsumerStatus,
    pub poll_interval: Duration,
    pub last_error: Option<StreamError>,
}

impl ConsumerState {
    fn new(id: u32, poll_interval: Duration) -> Self {
        Self {
            id,
            status: ConsumerStatus::Active,
            poll_interval,
            last_error: None,
        }
    }
}

/// Timing shared by every consumer of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Poll interval while not throttled
    pub base_poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            base_poll_interval: Duration::from_millis(100),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Doubling retry delay, capped
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}
