//! Threshold policy mapping a utilization signal to a consumption decision

use crate::aggregate::UtilizationSignal;
use crate::error::PolicyConfigError;
use std::fmt;
use std::time::Duration;

/// What the pool should do for the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Normal operation at the base poll interval
    Resume,
    /// Stay active but poll at the given interval
    Throttle(Duration),
    /// Stop consuming, keep the subscription
    Pause,
}

impl ThrottleDecision {
    /// Pause > Throttle > Resume
    pub fn severity(&self) -> u8 {
        match self {
            ThrottleDecision::Resume => 0,
            ThrottleDecision::Throttle(_) => 1,
            ThrottleDecision::Pause => 2,
        }
    }
}

impl fmt::Display for ThrottleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleDecision::Resume => write!(f, "resume"),
            ThrottleDecision::Throttle(interval) => write!(f, "throttle({}ms)", interval.as_millis()),
            ThrottleDecision::Pause => write!(f, "pause"),
        }
    }
}

/// Two ordered thresholds; equality falls in the more severe band
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    throttle_threshold: f64,
    pause_threshold: f64,
    throttle_interval: Duration,
}

impl ThrottlePolicy {
    pub fn new(
        throttle_threshold: f64,
        pause_threshold: f64,
        throttle_interval: Duration,
    ) -> Result<Self, PolicyConfigError> {
        check_range("throttle", throttle_threshold)?;
        check_range("pause", pause_threshold)?;
        if throttle_threshold >= pause_threshold {
            return Err(PolicyConfigError::Ordering {
                throttle: throttle_threshold,
                pause: pause_threshold,
            });
        }
        if throttle_interval.is_zero() {
            return Err(PolicyConfigError::ZeroInterval);
        }

        Ok(Self {
            throttle_threshold,
            pause_threshold,
            throttle_interval,
        })
    }

    pub fn decide(&self, signal: UtilizationSignal) -> ThrottleDecision {
        let value = signal.value();
        if value >= self.pause_threshold {
            ThrottleDecision::Pause
        } else if value >= self.throttle_threshold {
            ThrottleDecision::Throttle(self.throttle_interval)
        } else {
            ThrottleDecision::Resume
        }
    }

    pub fn throttle_threshold(&self) -> f64 {
        self.throttle_threshold
    }

    pub fn pause_threshold(&self) -> f64 {
        self.pause_threshold
    }

    pub fn throttle_interval(&self) -> Duration {
        self.throttle_interval
    }
}

fn check_range(name: &'static str, value: f64) -> Result<(), PolicyConfigError> {
    // NaN fails the range check too
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(PolicyConfigError::OutOfRange { name, value })
    }
}
