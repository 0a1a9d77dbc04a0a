use super::{
    Backoff, ConsumerSettings, ConsumerState, ConsumerStatus, MessageSink, StreamClient,
};
use crate::error::{ConsumerError, StreamError};
use crate::policy::ThrottleDecision;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Control side of one consumer.
///
/// State lives in a watch channel: every mutation is one atomic update that
/// also wakes the receive loop, so a paused loop blocks instead of polling.
pub struct ConsumerHandle {
    id: u32,
    base_poll_interval: Duration,
    state: Arc<watch::Sender<ConsumerState>>,
    task: Mutex<Option<JoinHandle<Result<(), ConsumerError>>>>,
}

impl ConsumerHandle {
    /// Subscribe `client` to `topic` and start the receive loop
    pub async fn spawn(
        id: u32,
        mut client: Box<dyn StreamClient>,
        topic: &str,
        sink: Arc<dyn MessageSink>,
        settings: ConsumerSettings,
    ) -> Result<Self, ConsumerError> {
        if let Err(source) = client.subscribe(topic).await {
            if let Err(e) = client.close().await {
                debug!(consumer = id, "Close after failed subscribe: {}", e);
            }
            return Err(ConsumerError::Subscribe {
                id,
                topic: topic.to_string(),
                source,
            });
        }
        info!(consumer = id, topic, "Consumer subscribed");

        let (tx, updates) = watch::channel(ConsumerState::new(id, settings.base_poll_interval));
        let state = Arc::new(tx);
        let receive_loop = ReceiveLoop {
            id,
            client,
            sink,
            settings,
            state: Arc::clone(&state),
            updates,
        };
        let task = tokio::spawn(receive_loop.run());

        Ok(Self {
            id,
            base_poll_interval: settings.base_poll_interval,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConsumerStatus {
        self.state.borrow().status
    }

    /// Returns whether the status changed
    pub fn pause(&self) -> Result<bool, ConsumerError> {
        self.transition(|state| replace_status(state, ConsumerStatus::Paused))
    }

    pub fn resume(&self) -> Result<bool, ConsumerError> {
        self.transition(|state| replace_status(state, ConsumerStatus::Active))
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Result<bool, ConsumerError> {
        self.transition(|state| {
            if state.poll_interval == interval {
                return false;
            }
            state.poll_interval = interval;
            true
        })
    }

    /// Status and interval for `decision`, in a single update
    pub fn apply(&self, decision: &ThrottleDecision) -> Result<bool, ConsumerError> {
        let base = self.base_poll_interval;
        self.transition(|state| {
            let (status, interval) = match decision {
                ThrottleDecision::Resume => (ConsumerStatus::Active, base),
                ThrottleDecision::Throttle(interval) => (ConsumerStatus::Active, *interval),
                ThrottleDecision::Pause => (ConsumerStatus::Paused, state.poll_interval),
            };
            let changed = state.status != status || state.poll_interval != interval;
            state.status = status;
            state.poll_interval = interval;
            changed
        })
    }

    /// Request termination. Irreversible; returns false if already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self
            .state
            .send_if_modified(|state| replace_status(state, ConsumerStatus::Stopped));
        if stopped {
            debug!(consumer = self.id, "Stop requested");
        }
        stopped
    }

    /// True once the receive loop has exited (or was already joined)
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the receive loop to exit. Later calls return `Ok(())`.
    pub async fn join(&self) -> Result<(), ConsumerError> {
        let task = self.task.lock().take();
        match task {
            None => Ok(()),
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ConsumerError::Panicked {
                    id: self.id,
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn transition(&self, update: impl FnOnce(&mut ConsumerState) -> bool) -> Result<bool, ConsumerError> {
        let mut stopped = false;
        let changed = self.state.send_if_modified(|state| {
            if state.status == ConsumerStatus::Stopped {
                stopped = true;
                return false;
            }
            update(state)
        });

        if stopped {
            Err(ConsumerError::Stopped { id: self.id })
        } else {
            Ok(changed)
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave its loop running
        self.stop();
    }
}

fn replace_status(state: &mut ConsumerState, status: ConsumerStatus) -> bool {
    if state.status == status {
        return false;
    }
    state.status = status;
    true
}

/// Task side of one consumer
struct ReceiveLoop {
    id: u32,
    client: Box<dyn StreamClient>,
    sink: Arc<dyn MessageSink>,
    settings: ConsumerSettings,
    state: Arc<watch::Sender<ConsumerState>>,
    updates: watch::Receiver<ConsumerState>,
}

impl ReceiveLoop {
    async fn run(mut self) -> Result<(), ConsumerError> {
        let outcome = self.consume().await;

        if let Err(e) = self.client.close().await {
            warn!(consumer = self.id, "Failed to close stream client: {}", e);
        }
        // A fatal exit happens without anyone calling stop()
        self.state
            .send_if_modified(|state| replace_status(state, ConsumerStatus::Stopped));

        match &outcome {
            Ok(()) => info!(consumer = self.id, "Consumer stopped"),
            Err(e) => error!(consumer = self.id, "{}", e),
        }
        outcome
    }

    async fn consume(&mut self) -> Result<(), ConsumerError> {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut client_paused = false;
        let mut not_before: Option<Instant> = None;

        loop {
            let state = self.updates.borrow_and_update().clone();

            match state.status {
                ConsumerStatus::Stopped => return Ok(()),

                ConsumerStatus::Paused => {
                    if !client_paused {
                        if let Err(e) = self.client.pause_assigned().await {
                            self.on_stream_error(e, &mut backoff).await?;
                            continue;
                        }
                        client_paused = true;
                        info!(consumer = self.id, "Consumption paused");
                    }
                    if !self.state_changed().await {
                        return Ok(());
                    }
                }

                ConsumerStatus::Active => {
                    if client_paused {
                        if let Err(e) = self.client.resume_assigned().await {
                            self.on_stream_error(e, &mut backoff).await?;
                            continue;
                        }
                        client_paused = false;
                        info!(consumer = self.id, "Consumption resumed");
                    }

                    let throttled = state.poll_interval > self.settings.base_poll_interval;
                    if let Some(deadline) = not_before.take() {
                        if throttled && !self.sleep_until_unless_changed(deadline).await {
                            continue;
                        }
                    }

                    let started = Instant::now();
                    let received = tokio::select! {
                        changed = self.updates.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                            continue;
                        }
                        received = self.client.receive(state.poll_interval) => received,
                    };

                    match received {
                        Ok(Some(message)) => {
                            backoff.reset();
                            debug!(consumer = self.id, topic = %message.topic, "Delivering message");
                            self.sink.deliver(self.id, message).await;
                            if throttled {
                                not_before = Some(started + state.poll_interval);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => self.on_stream_error(e, &mut backoff).await?,
                    }
                }
            }
        }
    }

    /// Record the error; transient ones wait out a backoff, fatal ones end the loop
    async fn on_stream_error(
        &mut self,
        error: StreamError,
        backoff: &mut Backoff,
    ) -> Result<(), ConsumerError> {
        // Not a status change, so receivers are not woken
        self.state.send_if_modified(|state| {
            state.last_error = Some(error.clone());
            false
        });

        if error.is_fatal() {
            return Err(ConsumerError::Fatal {
                id: self.id,
                source: error,
            });
        }

        let delay = backoff.next_delay();
        warn!(
            consumer = self.id,
            retry_in_ms = delay.as_millis() as u64,
            "Stream error: {}",
            error
        );
        self.sleep_until_unless_changed(Instant::now() + delay).await;
        Ok(())
    }

    /// Block until the handle publishes a change. False if the channel closed.
    async fn state_changed(&mut self) -> bool {
        self.updates.changed().await.is_ok()
    }

    /// True if the deadline passed, false if interrupted by a state change
    async fn sleep_until_unless_changed(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.updates.changed() => false,
        }
    }
}
