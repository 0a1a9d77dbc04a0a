/*!
Sampler replaying a fixed script of probe results
*/

use crate::builders::reading;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use symbion_throttle::error::ProbeError;
use symbion_throttle::sampler::{ResourceReading, ResourceSampler};

enum Step {
    Readings(Vec<ResourceReading>),
    Fail(ProbeError),
    /// Never completes; exercises the probe timeout
    Hang,
}

/// Each `sample()` call consumes the next step. An exhausted script fails
/// with `ProbeError::Unavailable`.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<Step>>,
    calls: Arc<AtomicUsize>,
}

impl Default for ScriptedSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSampler {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// One single-unit sample per value
    pub fn from_signals(signals: &[f64]) -> Self {
        signals
            .iter()
            .fold(Self::new(), |sampler, value| sampler.then_signal(*value))
    }

    pub fn then_signal(self, utilization: f64) -> Self {
        self.then_readings(vec![reading(0, utilization, 0.0)])
    }

    pub fn then_readings(self, readings: Vec<ResourceReading>) -> Self {
        self.script.lock().push_back(Step::Readings(readings));
        self
    }

    pub fn then_failure(self, error: ProbeError) -> Self {
        self.script.lock().push_back(Step::Fail(error));
        self
    }

    pub fn then_failures(self, count: usize) -> Self {
        (0..count).fold(self, |sampler, n| {
            sampler.then_failure(ProbeError::Unavailable(format!("scripted failure {}", n + 1)))
        })
    }

    pub fn then_hang(self) -> Self {
        self.script.lock().push_back(Step::Hang);
        self
    }

    /// Shared counter of `sample()` calls, usable after the sampler is boxed
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl ResourceSampler for ScriptedSampler {
    async fn sample(&self) -> Result<Vec<ResourceReading>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Readings(readings)) => Ok(readings),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(ProbeError::Unavailable("script exhausted".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
