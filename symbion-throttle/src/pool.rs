//! Fixed pool of consumers sharing one throttle decision

use crate::consumer::{ConsumerHandle, ConsumerSettings, ConsumerState, MessageSink, StreamClient};
use crate::error::ConsumerError;
use crate::policy::ThrottleDecision;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of applying one decision across the pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub changed: usize,
    pub unchanged: usize,
    /// Members already stopped (fatal consumers), left untouched
    pub stopped: usize,
}

/// What happened to the members on shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub consumers: usize,
    pub failures: Vec<ConsumerError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Membership is fixed once built; handles are keyed by consumer id
#[derive(Default)]
pub struct ConsumerPool {
    consumers: BTreeMap<u32, ConsumerHandle>,
}

impl ConsumerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn consumers `1..=count`, each on the client returned by `connect`.
    /// If one fails to subscribe, those already started are shut down.
    pub async fn spawn<F>(
        count: u32,
        topic: &str,
        sink: Arc<dyn MessageSink>,
        settings: ConsumerSettings,
        mut connect: F,
    ) -> Result<Self, ConsumerError>
    where
        F: FnMut(u32) -> Box<dyn StreamClient>,
    {
        let mut pool = Self::new();
        for id in 1..=count {
            let spawned = ConsumerHandle::spawn(id, connect(id), topic, Arc::clone(&sink), settings).await;
            match spawned {
                Ok(handle) => pool.insert(handle)?,
                Err(e) => {
                    warn!("Consumer {} failed to start, stopping {} started", id, pool.len());
                    pool.shutdown().await;
                    return Err(e);
                }
            }
        }
        info!("Started {} consumers on {}", pool.len(), topic);
        Ok(pool)
    }

    pub fn insert(&mut self, handle: ConsumerHandle) -> Result<(), ConsumerError> {
        let id = handle.id();
        if self.consumers.contains_key(&id) {
            handle.stop();
            return Err(ConsumerError::Duplicate { id });
        }
        self.consumers.insert(id, handle);
        Ok(())
    }

    /// Apply `decision` to every member. Returns once each member's state reflects it.
    pub fn apply(&self, decision: &ThrottleDecision) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for handle in self.consumers.values() {
            match handle.apply(decision) {
                Ok(true) => summary.changed += 1,
                Ok(false) => summary.unchanged += 1,
                Err(ConsumerError::Stopped { id }) => {
                    debug!(consumer = id, "Skipping stopped consumer");
                    summary.stopped += 1;
                }
                Err(e) => {
                    warn!("Unexpected error applying {}: {}", decision, e);
                    summary.stopped += 1;
                }
            }
        }
        summary
    }

    pub fn states(&self) -> Vec<ConsumerState> {
        self.consumers.values().map(ConsumerHandle::state).collect()
    }

    pub fn get(&self, id: u32) -> Option<&ConsumerHandle> {
        self.consumers.get(&id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConsumerHandle> {
        self.consumers.values()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Stop every member, then wait for every receive loop to exit
    pub async fn shutdown(&self) -> ShutdownReport {
        for handle in self.consumers.values() {
            handle.stop();
        }

        let results = join_all(self.consumers.values().map(ConsumerHandle::join)).await;
        let failures: Vec<ConsumerError> = results.into_iter().filter_map(Result::err).collect();

        info!(
            "Consumer pool shut down ({} consumers, {} failed)",
            self.consumers.len(),
            failures.len()
        );
        ShutdownReport {
            consumers: self.consumers.len(),
            failures,
        }
    }
}
