//! Reduction of per-unit readings into one decision signal

use crate::error::AggregationError;
use crate::sampler::ResourceReading;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate pressure across all resource units, in percent
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct UtilizationSignal(f64);

impl UtilizationSignal {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for UtilizationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.0)
    }
}

/// How readings are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Unweighted arithmetic mean: pressure on the pool as a whole
    #[default]
    Mean,
    /// Busiest unit wins
    Max,
}

/// Which reading field feeds the signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    #[default]
    Utilization,
    OccupiedCapacity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilizationAggregator {
    strategy: AggregationStrategy,
    source: SignalSource,
}

impl UtilizationAggregator {
    pub fn new(strategy: AggregationStrategy, source: SignalSource) -> Self {
        Self { strategy, source }
    }

    pub fn aggregate(&self, readings: &[ResourceReading]) -> Result<UtilizationSignal, AggregationError> {
        if readings.is_empty() {
            return Err(AggregationError::NoResourceUnits);
        }

        let mut total = 0.0;
        let mut peak = f64::MIN;
        for reading in readings {
            let value = match self.source {
                SignalSource::Utilization => reading.utilization_percent,
                SignalSource::OccupiedCapacity => reading.occupied_capacity_percent,
            };
            if !value.is_finite() {
                return Err(AggregationError::NonFiniteReading { unit_id: reading.unit_id });
            }
            total += value;
            peak = peak.max(value);
        }

        let value = match self.strategy {
            AggregationStrategy::Mean => total / readings.len() as f64,
            AggregationStrategy::Max => peak,
        };
        Ok(UtilizationSignal(value))
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.strategy
    }

    pub fn source(&self) -> SignalSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(unit_id: u32, utilization: f64, occupied: f64) -> ResourceReading {
        ResourceReading {
            unit_id,
            utilization_percent: utilization,
            occupied_capacity_percent: occupied,
        }
    }

    #[test]
    fn test_empty_input_fails() {
        for strategy in [AggregationStrategy::Mean, AggregationStrategy::Max] {
            for source in [SignalSource::Utilization, SignalSource::OccupiedCapacity] {
                let aggregator = UtilizationAggregator::new(strategy, source);
                assert_eq!(aggregator.aggregate(&[]), Err(AggregationError::NoResourceUnits));
            }
        }
    }

    #[test]
    fn test_mean_is_exact() {
        let aggregator = UtilizationAggregator::default();
        let signal = aggregator
            .aggregate(&[reading(0, 50.0, 10.0), reading(1, 30.0, 90.0)])
            .unwrap();
        assert_eq!(signal.value(), 40.0);
    }

    #[test]
    fn test_max_strategy() {
        let aggregator = UtilizationAggregator::new(AggregationStrategy::Max, SignalSource::Utilization);
        let signal = aggregator
            .aggregate(&[reading(0, 12.0, 0.0), reading(1, 97.0, 0.0), reading(2, 40.0, 0.0)])
            .unwrap();
        assert_eq!(signal.value(), 97.0);
    }

    #[test]
    fn test_occupied_capacity_source() {
        let aggregator = UtilizationAggregator::new(AggregationStrategy::Mean, SignalSource::OccupiedCapacity);
        let signal = aggregator
            .aggregate(&[reading(0, 50.0, 10.0), reading(1, 30.0, 90.0)])
            .unwrap();
        assert_eq!(signal.value(), 50.0);
    }

    #[test]
    fn test_non_finite_reading_rejected() {
        let aggregator = UtilizationAggregator::default();
        assert_eq!(
            aggregator.aggregate(&[reading(0, 10.0, 0.0), reading(3, f64::NAN, 0.0)]),
            Err(AggregationError::NonFiniteReading { unit_id: 3 })
        );
    }

    #[test]
    fn test_single_unit() {
        let aggregator = UtilizationAggregator::default();
        assert_eq!(aggregator.aggregate(&[reading(7, 63.5, 1.0)]).unwrap().value(), 63.5);
    }
}
