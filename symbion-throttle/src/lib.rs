//! Symbion Throttle - adaptive consumption throttling driven by accelerator load
//!
//! A control loop samples accelerator utilization, reduces it to one signal
//! and, through a three-band policy, paces, pauses or resumes a pool of
//! stream consumers:
//! - `sampler`: resource probes (`nvidia-smi`, host CPU)
//! - `aggregate` / `policy`: signal reduction and the resume/throttle/pause decision
//! - `consumer` / `pool`: per-consumer state machine and receive loop over MQTT
//! - `control`: the periodic sample → decide → apply cycle
//! - `status`: optional status snapshots published over MQTT

pub mod aggregate;
pub mod config;
pub mod consumer;
pub mod control;
pub mod error;
pub mod policy;
pub mod pool;
pub mod sampler;
pub mod status;

pub use aggregate::{AggregationStrategy, SignalSource, UtilizationAggregator, UtilizationSignal};
pub use config::ThrottleConfig;
pub use consumer::{
    ConsumerHandle, ConsumerSettings, ConsumerState, ConsumerStatus, LogSink, MessageSink,
    StreamClient, StreamMessage,
};
pub use control::{ControlLoop, ControlSettings, ProbeFailurePolicy, TickOutcome};
pub use error::{
    AggregationError, ConfigError, ConsumerError, PolicyConfigError, ProbeError, StreamError,
    TickError,
};
pub use policy::{ThrottleDecision, ThrottlePolicy};
pub use pool::{ApplySummary, ConsumerPool, ShutdownReport};
pub use sampler::{ResourceReading, ResourceSampler};
pub use status::StatusTracker;
