//! Resource sampling for the throttling controller
//!
//! A sampler returns one reading per resource unit (one accelerator, or one
//! logical CPU for the host sampler). Probe output is parsed strictly: a single
//! malformed record fails the whole sample rather than skewing the average.

mod nvidia;
mod system;

pub use nvidia::{NvidiaSmiSampler, DEFAULT_COMMAND as DEFAULT_PROBE_COMMAND};
pub use system::SystemSampler;

use crate::config::{SamplerBackend, SamplerConfig};
use crate::error::{ConfigError, ProbeError};
use async_trait::async_trait;
use serde::Serialize;

/// Utilization of one resource unit at sampling time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceReading {
    pub unit_id: u32,
    pub utilization_percent: f64,
    pub occupied_capacity_percent: f64,
}

/// Source of resource readings
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Sample every resource unit. An empty vector means "no units", not a failure.
    async fn sample(&self) -> Result<Vec<ResourceReading>, ProbeError>;

    /// Short label for logs
    fn name(&self) -> &str;
}

/// Build the sampler selected in configuration
pub fn build_sampler(config: &SamplerConfig) -> Result<Box<dyn ResourceSampler>, ConfigError> {
    match config.backend {
        SamplerBackend::NvidiaSmi => {
            let sampler = NvidiaSmiSampler::from_command_line(&config.command)
                .map_err(|e| ConfigError::Invalid(format!("sampler.command: {e}")))?;
            Ok(Box::new(sampler))
        }
        SamplerBackend::System => Ok(Box::new(SystemSampler::new())),
    }
}

/// Parse `index, used, total, utilization` records, one per line
pub fn parse_probe_output(output: &str) -> Result<Vec<ResourceReading>, ProbeError> {
    output
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_record(idx + 1, line))
        .collect()
}

fn parse_record(line: usize, record: &str) -> Result<ResourceReading, ProbeError> {
    let malformed = |reason: String| ProbeError::Malformed {
        line,
        record: record.to_string(),
        reason,
    };

    let fields: Vec<&str> = record.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(malformed(format!("expected 4 fields, found {}", fields.len())));
    }

    let unit_id: u32 = fields[0]
        .parse()
        .map_err(|_| malformed(format!("index {:?} is not an unsigned integer", fields[0])))?;
    let used = parse_amount("used capacity", fields[1]).map_err(&malformed)?;
    let total = parse_amount("total capacity", fields[2]).map_err(&malformed)?;
    let utilization = parse_amount("utilization", fields[3]).map_err(&malformed)?;

    if total == 0.0 {
        return Err(malformed("total capacity is zero".to_string()));
    }
    if used > total {
        return Err(malformed(format!("used capacity {used} exceeds total {total}")));
    }
    if utilization > 100.0 {
        return Err(malformed(format!("utilization {utilization} exceeds 100")));
    }

    Ok(ResourceReading {
        unit_id,
        utilization_percent: utilization,
        occupied_capacity_percent: used / total * 100.0,
    })
}

fn parse_amount(name: &str, field: &str) -> Result<f64, String> {
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(format!("{name} {field:?} is not a non-negative number")),
    }
}
