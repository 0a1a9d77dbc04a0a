/*!
Test harness for the consumer pool and control loop

- Spawns a pool whose members run on `MockStreamClient`s
- Records every delivery in a shared `RecordingSink`
- Builds control loops over that pool with short timings
*/

use crate::mock_stream::{MockStreamClient, MockStreamController};
use crate::recording_sink::RecordingSink;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use symbion_throttle::consumer::{ConsumerSettings, ConsumerStatus, MessageSink, StreamClient};
use symbion_throttle::control::{ControlLoop, ControlSettings};
use symbion_throttle::policy::ThrottlePolicy;
use symbion_throttle::pool::ConsumerPool;
use symbion_throttle::sampler::ResourceSampler;
use symbion_throttle::UtilizationAggregator;
use tokio::time::Instant;

pub const TEST_TOPIC: &str = "$share/test_group/symbion/jobs@v1";

/// Poll `condition` every 5 ms until it holds. False on timeout.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct TestHarness {
    pub pool: Arc<ConsumerPool>,
    pub sink: Arc<RecordingSink>,
    pub settings: ConsumerSettings,
    controllers: Vec<MockStreamController>,
}

impl TestHarness {
    /// Timings short enough for tests: 20 ms base interval, 10-80 ms backoff
    pub fn fast_settings() -> ConsumerSettings {
        ConsumerSettings {
            base_poll_interval: Duration::from_millis(20),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(80),
        }
    }

    pub async fn start(count: u32) -> Result<Self> {
        Self::start_with(count, Self::fast_settings()).await
    }

    pub async fn start_with(count: u32, settings: ConsumerSettings) -> Result<Self> {
        env_logger::try_init().ok();

        let sink = Arc::new(RecordingSink::new());
        let mut controllers = Vec::new();
        let pool = ConsumerPool::spawn(
            count,
            TEST_TOPIC,
            Arc::clone(&sink) as Arc<dyn MessageSink>,
            settings,
            |_id| {
                let (client, controller) = MockStreamClient::new();
                controllers.push(controller);
                Box::new(client) as Box<dyn StreamClient>
            },
        )
        .await
        .context("Failed to spawn mock pool")?;

        log::info!("🧪 Harness started with {} mock consumers", count);
        Ok(Self {
            pool: Arc::new(pool),
            sink,
            settings,
            controllers,
        })
    }

    /// Controller of consumer `id` (ids start at 1)
    pub fn controller(&self, id: u32) -> &MockStreamController {
        &self.controllers[(id - 1) as usize]
    }

    pub fn controllers(&self) -> &[MockStreamController] {
        &self.controllers
    }

    /// Control loop over this pool with default aggregation
    pub fn control_loop(
        &self,
        sampler: impl ResourceSampler + 'static,
        policy: ThrottlePolicy,
        settings: ControlSettings,
    ) -> ControlLoop {
        ControlLoop::new(
            Box::new(sampler),
            UtilizationAggregator::default(),
            policy,
            Arc::clone(&self.pool),
            settings,
        )
    }

    /// 50/70 thresholds with the given throttle interval
    pub fn policy(throttle_interval: Duration) -> ThrottlePolicy {
        match ThrottlePolicy::new(50.0, 70.0, throttle_interval) {
            Ok(policy) => policy,
            Err(e) => panic!("test policy rejected: {e}"),
        }
    }

    pub fn all_have_status(&self, status: ConsumerStatus) -> bool {
        self.pool.states().iter().all(|state| state.status == status)
    }

    pub async fn wait_for_status(&self, id: u32, status: ConsumerStatus, timeout: Duration) -> bool {
        let pool = &self.pool;
        wait_until(timeout, || {
            pool.get(id).map(|handle| handle.status()) == Some(status)
        })
        .await
    }

    pub async fn wait_for_calls(
        &self,
        id: u32,
        timeout: Duration,
        condition: impl Fn(&MockStreamController) -> bool,
    ) -> bool {
        let controller = self.controller(id);
        wait_until(timeout, || condition(controller)).await
    }
}
