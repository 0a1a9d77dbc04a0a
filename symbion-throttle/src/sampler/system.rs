//! Host CPU sampling via sysinfo
//!
//! Treats every logical CPU as a resource unit. Useful on hosts without
//! accelerators and for smoke-testing the controller end to end.

use super::{ResourceReading, ResourceSampler};
use crate::error::ProbeError;
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::System;
use tracing::debug;

/// Gap between the two CPU refreshes needed for a usage figure
const CPU_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct SystemSampler;

impl SystemSampler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResourceSampler for SystemSampler {
    async fn sample(&self) -> Result<Vec<ResourceReading>, ProbeError> {
        debug!("Collecting host CPU readings...");

        let mut sys = System::new();
        sys.refresh_cpu_usage();

        // Wait a moment for accurate CPU readings
        tokio::time::sleep(CPU_SETTLE).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total_memory = sys.total_memory();
        let occupied = if total_memory > 0 {
            sys.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        let readings: Vec<ResourceReading> = sys
            .cpus()
            .iter()
            .enumerate()
            .map(|(idx, cpu)| ResourceReading {
                unit_id: idx as u32,
                utilization_percent: f64::from(cpu.cpu_usage()).clamp(0.0, 100.0),
                occupied_capacity_percent: occupied.clamp(0.0, 100.0),
            })
            .collect();

        if readings.is_empty() {
            return Err(ProbeError::Unavailable("host reports no CPUs".to_string()));
        }
        Ok(readings)
    }

    fn name(&self) -> &str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_readings_in_range() {
        let readings = SystemSampler::new().sample().await.unwrap();
        assert!(!readings.is_empty());
        for (idx, reading) in readings.iter().enumerate() {
            assert_eq!(reading.unit_id, idx as u32);
            assert!((0.0..=100.0).contains(&reading.utilization_percent));
            assert!((0.0..=100.0).contains(&reading.occupied_capacity_percent));
        }
    }
}
