/*!
Mock stream client for running consumers without a broker

Each `MockStreamClient` comes with a `MockStreamController` sharing its
state: tests push messages or errors through the controller and inspect the
calls the receive loop made.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use symbion_throttle::consumer::{StreamClient, StreamMessage};
use symbion_throttle::error::StreamError;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One call made on the client, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCall {
    Subscribe(String),
    Pause,
    Resume,
    Receive(Duration),
    Close,
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<Result<StreamMessage, StreamError>>,
    calls: Vec<StreamCall>,
    subscribe_error: Option<StreamError>,
    subscribed: Option<String>,
    paused: bool,
    closed: bool,
}

pub struct MockStreamClient {
    shared: Arc<Mutex<Shared>>,
    arrivals: Arc<Notify>,
}

/// Test-side view of a `MockStreamClient`
#[derive(Clone)]
pub struct MockStreamController {
    shared: Arc<Mutex<Shared>>,
    arrivals: Arc<Notify>,
}

impl MockStreamClient {
    pub fn new() -> (Self, MockStreamController) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let arrivals = Arc::new(Notify::new());
        let controller = MockStreamController {
            shared: Arc::clone(&shared),
            arrivals: Arc::clone(&arrivals),
        };
        (Self { shared, arrivals }, controller)
    }

    /// A client whose subscribe call fails with `error`
    pub fn failing_subscribe(error: StreamError) -> (Self, MockStreamController) {
        let (client, controller) = Self::new();
        controller.shared.lock().subscribe_error = Some(error);
        (client, controller)
    }

    fn record(&self, call: StreamCall) {
        self.shared.lock().calls.push(call);
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        shared.calls.push(StreamCall::Subscribe(topic.to_string()));
        if let Some(error) = shared.subscribe_error.take() {
            return Err(error);
        }
        shared.subscribed = Some(topic.to_string());
        log::debug!("📥 [MOCK] Subscribed to {}", topic);
        Ok(())
    }

    async fn pause_assigned(&mut self) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        shared.calls.push(StreamCall::Pause);
        shared.paused = true;
        Ok(())
    }

    async fn resume_assigned(&mut self) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        shared.calls.push(StreamCall::Resume);
        shared.paused = false;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<StreamMessage>, StreamError> {
        self.record(StreamCall::Receive(timeout));
        let deadline = Instant::now() + timeout;

        loop {
            let next = self.shared.lock().queue.pop_front();
            if let Some(next) = next {
                return next.map(Some);
            }
            // notify_one keeps a permit, so a push between the check and here is not lost
            if tokio::time::timeout_at(deadline, self.arrivals.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let mut shared = self.shared.lock();
        shared.calls.push(StreamCall::Close);
        shared.closed = true;
        Ok(())
    }
}

impl MockStreamController {
    pub fn push_message(&self, message: StreamMessage) {
        self.shared.lock().queue.push_back(Ok(message));
        self.arrivals.notify_one();
    }

    pub fn push_messages(&self, messages: impl IntoIterator<Item = StreamMessage>) {
        self.shared.lock().queue.extend(messages.into_iter().map(Ok));
        self.arrivals.notify_one();
    }

    /// Make the next receive fail with `error`
    pub fn push_error(&self, error: StreamError) {
        self.shared.lock().queue.push_back(Err(error));
        self.arrivals.notify_one();
    }

    /// Items pushed but not yet received
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn calls(&self) -> Vec<StreamCall> {
        self.shared.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&StreamCall) -> bool) -> usize {
        self.shared.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn receive_count(&self) -> usize {
        self.count(|call| matches!(call, StreamCall::Receive(_)))
    }

    pub fn pause_count(&self) -> usize {
        self.count(|call| *call == StreamCall::Pause)
    }

    pub fn resume_count(&self) -> usize {
        self.count(|call| *call == StreamCall::Resume)
    }

    /// Timeout passed to the most recent receive
    pub fn last_receive_timeout(&self) -> Option<Duration> {
        self.shared.lock().calls.iter().rev().find_map(|call| match call {
            StreamCall::Receive(timeout) => Some(*timeout),
            _ => None,
        })
    }

    pub fn subscribed_topic(&self) -> Option<String> {
        self.shared.lock().subscribed.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}
