//! Control loop: sample → aggregate → decide → apply, on a fixed cadence

use crate::aggregate::{UtilizationAggregator, UtilizationSignal};
use crate::error::{ProbeError, TickError};
use crate::policy::{ThrottleDecision, ThrottlePolicy};
use crate::pool::{ApplySummary, ConsumerPool, ShutdownReport};
use crate::sampler::ResourceSampler;
use crate::status::StatusTracker;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What to apply once the probe has failed `failure_threshold` ticks in a row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailurePolicy {
    /// Keep whatever was last applied
    Hold,
    #[default]
    Throttle,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSettings {
    pub tick_interval: Duration,
    pub probe_timeout: Duration,
    pub on_probe_failure: ProbeFailurePolicy,
    pub failure_threshold: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            on_probe_failure: ProbeFailurePolicy::Throttle,
            failure_threshold: 3,
        }
    }
}

/// Result of a successful tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub signal: UtilizationSignal,
    pub decision: ThrottleDecision,
    pub summary: ApplySummary,
}

pub struct ControlLoop {
    sampler: Box<dyn ResourceSampler>,
    aggregator: UtilizationAggregator,
    policy: ThrottlePolicy,
    pool: Arc<ConsumerPool>,
    settings: ControlSettings,
    status: StatusTracker,
    consecutive_failures: u32,
    last_decision: Option<ThrottleDecision>,
}

impl ControlLoop {
    pub fn new(
        sampler: Box<dyn ResourceSampler>,
        aggregator: UtilizationAggregator,
        policy: ThrottlePolicy,
        pool: Arc<ConsumerPool>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            sampler,
            aggregator,
            policy,
            pool,
            settings,
            status: StatusTracker::new(),
            consecutive_failures: 0,
            last_decision: None,
        }
    }

    /// Share an existing tracker, e.g. one a status publisher already reads
    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.status = status;
        self
    }

    pub fn pool(&self) -> &Arc<ConsumerPool> {
        &self.pool
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn last_decision(&self) -> Option<ThrottleDecision> {
        self.last_decision
    }

    /// One cycle. On error nothing is applied, unless the failure streak has
    /// reached the threshold and the configured fallback is at least as
    /// severe as the decision in force.
    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        match self.evaluate().await {
            Ok((signal, decision)) => {
                self.consecutive_failures = 0;
                let summary = self.pool.apply(&decision);

                if self.last_decision != Some(decision) {
                    let previous = self
                        .last_decision
                        .map_or_else(|| "none".to_string(), |d| d.to_string());
                    let escalated = self
                        .last_decision
                        .is_some_and(|d| decision.severity() > d.severity());
                    if escalated {
                        warn!(signal = signal.value(), changed = summary.changed, "Escalating to {} (was {})", decision, previous);
                    } else {
                        info!(signal = signal.value(), changed = summary.changed, "Decision {} (was {})", decision, previous);
                    }
                } else {
                    debug!(signal = signal.value(), "Decision unchanged: {}", decision);
                }

                self.last_decision = Some(decision);
                self.status.record_tick(signal, decision);
                Ok(TickOutcome {
                    signal,
                    decision,
                    summary,
                })
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.status.record_failure(self.consecutive_failures);
                warn!(
                    consecutive = self.consecutive_failures,
                    "Tick skipped: {}", e
                );
                self.apply_fallback();
                Err(e)
            }
        }
    }

    async fn evaluate(&self) -> Result<(UtilizationSignal, ThrottleDecision), TickError> {
        let readings = tokio::time::timeout(self.settings.probe_timeout, self.sampler.sample())
            .await
            .map_err(|_| ProbeError::TimedOut(self.settings.probe_timeout))??;
        debug!(units = readings.len(), sampler = self.sampler.name(), "Sampled resources");

        let signal = self.aggregator.aggregate(&readings)?;
        Ok((signal, self.policy.decide(signal)))
    }

    fn apply_fallback(&mut self) {
        if self.consecutive_failures < self.settings.failure_threshold {
            return;
        }
        let decision = match self.settings.on_probe_failure {
            ProbeFailurePolicy::Hold => return,
            ProbeFailurePolicy::Throttle => ThrottleDecision::Throttle(self.policy.throttle_interval()),
            ProbeFailurePolicy::Pause => ThrottleDecision::Pause,
        };
        // A fallback only ever tightens; a paused pool stays paused
        if let Some(current) = self.last_decision {
            if current.severity() > decision.severity() {
                if self.consecutive_failures == self.settings.failure_threshold {
                    warn!(
                        "{} consecutive failed ticks, keeping {} over fallback {}",
                        self.consecutive_failures, current, decision
                    );
                }
                return;
            }
        }

        if self.consecutive_failures == self.settings.failure_threshold {
            warn!(
                "{} consecutive failed ticks, falling back to {}",
                self.consecutive_failures, decision
            );
        }
        self.pool.apply(&decision);
        self.last_decision = Some(decision);
        self.status.record_decision(decision);
    }

    /// Tick until `shutdown` resolves, then stop the pool and wait for every consumer
    pub async fn run<F>(mut self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Control loop started (tick {:?}, thresholds {}/{}%)",
            self.settings.tick_interval,
            self.policy.throttle_threshold(),
            self.policy.pause_threshold()
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping consumers");
                    break;
                }
                _ = ticker.tick() => {
                    // Failures are logged and counted inside tick()
                    let _ = self.tick().await;
                }
            }
        }

        self.pool.shutdown().await
    }
}
