//! Error taxonomy for the throttling controller
//!
//! Recovery depends on where an error is raised:
//! - probe and aggregation failures skip a single tick
//! - policy and config errors are fatal at startup only
//! - transient stream errors are retried inside the consumer
//! - fatal stream errors stop one consumer and are reported at shutdown

use std::path::PathBuf;
use std::time::Duration;

/// Resource probe failed to run or produced unusable output
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to spawn probe `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe `{command}` exited with {code:?}: {stderr}")]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("probe output is not valid UTF-8")]
    NonUtf8,
    #[error("malformed probe record on line {line} ({record:?}): {reason}")]
    Malformed {
        line: usize,
        record: String,
        reason: String,
    },
    #[error("probe did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("probe command is empty")]
    EmptyCommand,
    #[error("resource probe unavailable: {0}")]
    Unavailable(String),
}

/// Readings could not be reduced to a signal
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("no resource units reported")]
    NoResourceUnits,
    #[error("resource unit {unit_id} reported a non-finite value")]
    NonFiniteReading { unit_id: u32 },
}

/// Invalid thresholds handed to the policy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyConfigError {
    #[error("{name} threshold {value} is outside 0..=100")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("throttle threshold {throttle} must be below pause threshold {pause}")]
    Ordering { throttle: f64, pause: f64 },
    #[error("throttle interval must be greater than zero")]
    ZeroInterval,
}

/// Failure reported by a stream client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("transient stream failure: {0}")]
    Transient(String),
    #[error("stream client unusable: {0}")]
    Fatal(String),
}

impl StreamError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Fatal(_))
    }
}

/// Errors surfaced by a consumer handle or its receive loop
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer {id} is stopped")]
    Stopped { id: u32 },
    #[error("consumer {id} failed to subscribe to {topic}: {source}")]
    Subscribe {
        id: u32,
        topic: String,
        #[source]
        source: StreamError,
    },
    #[error("consumer {id} stopped on fatal stream error: {source}")]
    Fatal {
        id: u32,
        #[source]
        source: StreamError,
    },
    #[error("consumer {id} receive loop panicked: {reason}")]
    Panicked { id: u32, reason: String },
    #[error("consumer {id} is already part of the pool")]
    Duplicate { id: u32 },
}

/// Why a control-loop tick applied nothing
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Configuration could not be loaded or is invalid
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] PolicyConfigError),
}
