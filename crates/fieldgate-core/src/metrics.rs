//! Metrics model and in-memory collector.
//!
//! The pipeline reports counters through the fire-and-forget
//! [`MetricsSink`] trait; transporting or serializing them is the
//! embedding service's concern.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const METRICS_READS: &str = "reads";
pub const METRICS_READ_SUCCESS: &str = "read_success";
pub const METRICS_READ_ERRORS: &str = "read_errors";
pub const METRICS_VALUES_READ: &str = "values_read";
pub const METRICS_MESSAGES: &str = "messages";
pub const METRICS_WRITES: &str = "writes";
pub const METRICS_WRITE_SUCCESS: &str = "write_success";
pub const METRICS_WRITE_ERRORS: &str = "write_errors";

/// Source name used for datapoints produced by the pipeline itself.
pub const METRICS_CORE_SOURCE: &str = "core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnits {
    Count,
    Milliseconds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsDataPoint {
    pub name: String,
    pub units: MetricUnits,
    pub value: u64,
}

impl MetricsDataPoint {
    pub fn count(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            units: MetricUnits::Count,
            value,
        }
    }
}

/// Fire-and-forget metrics consumer; implementations must not block the
/// pipeline.
pub trait MetricsSink: Send + Sync {
    fn put(&self, source: &str, datapoints: Vec<MetricsDataPoint>);
}

/// In-memory [`MetricsSink`] accumulating counters per source and metric
/// name.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<(String, String), AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, source: &str, name: &str) -> u64 {
        self.counters
            .get(&(source.to_string(), name.to_string()))
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<(String, String), u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

impl MetricsSink for MetricsCollector {
    fn put(&self, source: &str, datapoints: Vec<MetricsDataPoint>) {
        for datapoint in datapoints {
            self.counters
                .entry((source.to_string(), datapoint.name))
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(datapoint.value, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_source_and_name() {
        let collector = MetricsCollector::new();

        collector.put(
            "core",
            vec![
                MetricsDataPoint::count(METRICS_READS, 1),
                MetricsDataPoint::count(METRICS_READ_SUCCESS, 1),
            ],
        );
        collector.put("core", vec![MetricsDataPoint::count(METRICS_READS, 1)]);
        collector.put("press", vec![MetricsDataPoint::count(METRICS_READS, 5)]);

        assert_eq!(collector.value("core", METRICS_READS), 2);
        assert_eq!(collector.value("core", METRICS_READ_SUCCESS), 1);
        assert_eq!(collector.value("press", METRICS_READS), 5);
        assert_eq!(collector.value("press", METRICS_READ_SUCCESS), 0);
        assert_eq!(collector.snapshot().len(), 3);
    }
}
