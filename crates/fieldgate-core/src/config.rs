//! Configuration types for schedules, sources and pipeline tuning.
//!
//! Parsing a configuration file into these types is the responsibility of
//! the embedding service; the pipeline treats a [`GatewayConfig`] as an
//! immutable input for the lifetime of its schedules.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channels::OverflowPolicy;
use crate::data::{ChannelId, SourceId, TargetId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("schedule `{schedule}`: {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("schedule `{0}` is not configured")]
    UnknownSchedule(String),
}

impl ConfigError {
    fn invalid(schedule: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            schedule: schedule.to_string(),
            reason: reason.into(),
        }
    }
}

/// Granularity at which timestamps are attached to output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampLevel {
    /// No timestamps on output data.
    None,
    /// One timestamp per source.
    #[default]
    Source,
    /// One timestamp per channel value.
    Channel,
    /// Timestamps on both source and channel level.
    Both,
}

impl TimestampLevel {
    pub fn source_timestamp(self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }

    pub fn channel_timestamp(self) -> bool {
        matches!(self, Self::Channel | Self::Both)
    }
}

fn default_aggregation_outputs() -> Vec<String> {
    vec!["values".to_string()]
}

/// Batching configuration for a schedule that aggregates cycle outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Number of cycles to accumulate before one aggregated batch is emitted.
    pub size: usize,
    /// Names of the aggregation outputs to produce, see
    /// [`crate::aggregations::builtin`].
    #[serde(default = "default_aggregation_outputs")]
    pub outputs: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    1000
}

/// One recurring pipeline instance: which sources and channels to read, at
/// what cadence, and which targets receive the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Cycle interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Selected channel IDs per source. An empty channel list selects every
    /// configured channel of the source.
    pub sources: HashMap<SourceId, Vec<ChannelId>>,
    pub targets: Vec<TargetId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub timestamp_level: TimestampLevel,
    #[serde(default)]
    pub aggregation: Option<AggregationConfig>,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregation.is_some()
    }

    /// Aggregation batch size; 0 when the schedule does not aggregate.
    pub fn aggregation_size(&self) -> usize {
        self.aggregation.as_ref().map(|a| a.size).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid(&self.name, "schedule name is empty"));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid(&self.name, "interval must be > 0"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid(&self.name, "no sources configured"));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::invalid(&self.name, "no targets configured"));
        }
        if let Some(aggregation) = &self.aggregation {
            if aggregation.size == 0 {
                return Err(ConfigError::invalid(
                    &self.name,
                    "aggregation size must be > 0",
                ));
            }
        }
        Ok(())
    }
}

/// Per-channel configuration within a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Display name used in delivered data; the channel ID when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// ID of the transformation applied to this channel's values.
    #[serde(default)]
    pub transformation: Option<String>,
    /// ID of the change filter applied to this channel's values.
    #[serde(default)]
    pub change_filter: Option<String>,
    /// ID of the value filter applied to this channel's values.
    #[serde(default)]
    pub value_filter: Option<String>,
}

/// Configuration of one protocol-adapter-backed source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Display name used in delivered data; the source ID when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub channels: HashMap<ChannelId, ChannelConfig>,
}

fn default_max_concurrent_source_readers() -> usize {
    10
}

fn default_all_sources_read_timeout_ms() -> u64 {
    10_000
}

fn default_results_channel_size() -> usize {
    500
}

fn default_channel_timeout_ms() -> u64 {
    1000
}

fn default_channel_size() -> usize {
    1000
}

fn default_per_target_write_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

/// Tuning parameters for channel sizes, timeouts and concurrency limits.
///
/// The defaults are sized for steady throughput on a handful of sources;
/// the blocking/timeout warnings emitted by the channel submit helper name
/// the parameter to raise when a deployment outgrows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Maximum number of source reads running concurrently in one cycle.
    pub max_concurrent_source_readers: usize,
    /// Total budget for reading and combining all sources in one cycle.
    pub all_sources_read_timeout_ms: u64,
    pub reader_results_channel_size: usize,
    pub reader_results_channel_timeout_ms: u64,
    pub aggregator_channel_size: usize,
    pub aggregator_channel_timeout_ms: u64,
    pub writer_input_channel_size: usize,
    pub writer_input_channel_timeout_ms: u64,
    pub per_target_write_timeout_ms: u64,
    /// Total budget for draining reader, aggregator and writer on close.
    pub shutdown_timeout_ms: u64,
    /// What a full inter-stage channel does to a submitter.
    pub overflow_policy: OverflowPolicy,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_concurrent_source_readers: default_max_concurrent_source_readers(),
            all_sources_read_timeout_ms: default_all_sources_read_timeout_ms(),
            reader_results_channel_size: default_results_channel_size(),
            reader_results_channel_timeout_ms: default_channel_timeout_ms(),
            aggregator_channel_size: default_channel_size(),
            aggregator_channel_timeout_ms: default_channel_timeout_ms(),
            writer_input_channel_size: default_channel_size(),
            writer_input_channel_timeout_ms: default_channel_timeout_ms(),
            per_target_write_timeout_ms: default_per_target_write_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl TuningConfig {
    pub fn all_sources_read_timeout(&self) -> Duration {
        Duration::from_millis(self.all_sources_read_timeout_ms)
    }

    pub fn reader_results_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_results_channel_timeout_ms)
    }

    pub fn aggregator_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregator_channel_timeout_ms)
    }

    pub fn writer_input_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_input_channel_timeout_ms)
    }

    pub fn per_target_write_timeout(&self) -> Duration {
        Duration::from_millis(self.per_target_write_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Top-level configuration consumed by the pipeline: schedules, the sources
/// they read, gateway-wide metadata added to every delivery, and tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub sources: HashMap<SourceId, SourceConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl GatewayConfig {
    pub fn schedule(&self, name: &str) -> Result<&ScheduleConfig, ConfigError> {
        self.schedules
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownSchedule(name.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for schedule in &self.schedules {
            schedule.validate()?;
        }
        Ok(())
    }
}
