//! Schedule controller: channel wiring and lifecycle for one schedule's
//! reader/[aggregator]/writer trio.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldgate_core::aggregations::{self, AggregationFn};
use fieldgate_core::channels::ChannelSink;
use fieldgate_core::config::{ConfigError, GatewayConfig};
use fieldgate_core::data::{SourceId, TargetId};
use fieldgate_core::filters::{ChangeFilterCache, ChangeFilterConfig, Filter};
use fieldgate_core::metrics::MetricsSink;
use fieldgate_core::sources::SourceValuesReader;
use fieldgate_core::targets::TargetWriter;
use fieldgate_core::transformations::Transformation;

use crate::aggregator::ScheduleAggregator;
use crate::reader::{ReaderContext, ScheduleReader};
use crate::writer::{ScheduleWriter, WriterContext};

/// Collaborators wired into a schedule at startup: adapter and target
/// instances, the filter and transformation registries referenced by
/// channel configuration, the aggregation function and the metrics sink.
/// Explicit instances, passed by reference into the pipeline — never
/// retrieved from global state.
pub struct ScheduleEnvironment {
    pub readers: HashMap<SourceId, Arc<dyn SourceValuesReader>>,
    pub targets: HashMap<TargetId, Arc<dyn TargetWriter>>,
    pub transformations: HashMap<String, Arc<dyn Transformation>>,
    pub value_filters: HashMap<String, Arc<dyn Filter>>,
    pub change_filters: HashMap<String, ChangeFilterConfig>,
    /// Overrides the schedule's configured aggregation outputs when set.
    pub aggregation: Option<AggregationFn>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for ScheduleEnvironment {
    fn default() -> Self {
        Self {
            readers: HashMap::new(),
            targets: HashMap::new(),
            transformations: HashMap::new(),
            value_filters: HashMap::new(),
            change_filters: HashMap::new(),
            aggregation: None,
            metrics: None,
        }
    }
}

/// Owns the channels and stage lifecycles for one schedule.
///
/// Data flows reader → [aggregator →] writer over bounded channels; the
/// controller creates the channels, starts the stages and coordinates the
/// cancel-then-bounded-wait shutdown.
pub struct ScheduleController {
    schedule_name: String,
    shutdown_timeout: Duration,
    token: CancellationToken,
    reader: ScheduleReader,
    aggregator: Option<ScheduleAggregator>,
    writer: ScheduleWriter,
}

impl ScheduleController {
    pub fn start(
        config: Arc<GatewayConfig>,
        schedule_name: &str,
        environment: ScheduleEnvironment,
    ) -> Result<Self, ConfigError> {
        let schedule = Arc::new(config.schedule(schedule_name)?.clone());
        schedule.validate()?;

        if !schedule.active {
            return Err(ConfigError::InvalidSchedule {
                schedule: schedule.name.clone(),
                reason: "schedule is not active".to_string(),
            });
        }

        let mut readers = HashMap::with_capacity(schedule.sources.len());
        for source in schedule.sources.keys() {
            let Some(adapter) = environment.readers.get(source) else {
                return Err(ConfigError::InvalidSchedule {
                    schedule: schedule.name.clone(),
                    reason: format!("no source reader wired for source `{source}`"),
                });
            };
            readers.insert(source.clone(), adapter.clone());
        }

        let mut targets = HashMap::with_capacity(schedule.targets.len());
        for target in &schedule.targets {
            let Some(writer) = environment.targets.get(target) else {
                return Err(ConfigError::InvalidSchedule {
                    schedule: schedule.name.clone(),
                    reason: format!("no target writer wired for target `{target}`"),
                });
            };
            targets.insert(target.clone(), writer.clone());
        }

        let tuning = &config.tuning;
        let token = CancellationToken::new();

        let (writer_tx, writer_rx) = mpsc::channel(tuning.writer_input_channel_size);
        let writer_sink = ChannelSink::new(
            writer_tx,
            "writer input",
            tuning.writer_input_channel_size,
            tuning.writer_input_channel_timeout(),
            tuning.overflow_policy,
        )
        .with_tuning_hints("writer_input_channel_size", "writer_input_channel_timeout_ms");

        let writer = ScheduleWriter::start(WriterContext {
            config: config.clone(),
            schedule: schedule.clone(),
            targets,
            metrics: environment.metrics.clone(),
            input: writer_rx,
        });

        // The aggregator input channel is sized to the aggregation batch
        // size, so one full window fits without backpressure; the tuning
        // parameter caps it for very large windows.
        let (aggregator, aggregator_sink) = if schedule.is_aggregated() {
            let size = schedule.aggregation_size();
            let capacity = size.clamp(1, tuning.aggregator_channel_size.max(1));
            let (aggregator_tx, aggregator_rx) = mpsc::channel(capacity);
            let sink = ChannelSink::new(
                aggregator_tx,
                "aggregator input",
                capacity,
                tuning.aggregator_channel_timeout(),
                tuning.overflow_policy,
            )
            .with_tuning_hints("aggregator_channel_size", "aggregator_channel_timeout_ms");

            let aggregation = match environment.aggregation.clone() {
                Some(aggregation) => aggregation,
                None => {
                    let output = schedule
                        .aggregation
                        .as_ref()
                        .and_then(|a| a.outputs.first().cloned())
                        .unwrap_or_else(|| "values".to_string());
                    match aggregations::builtin(&output) {
                        Some(aggregation) => aggregation,
                        None => {
                            return Err(ConfigError::InvalidSchedule {
                                schedule: schedule.name.clone(),
                                reason: format!("unknown aggregation output `{output}`"),
                            });
                        }
                    }
                }
            };

            let aggregator = ScheduleAggregator::start(
                schedule.name.clone(),
                size,
                aggregation,
                aggregator_rx,
                writer_sink.clone(),
            );
            (Some(aggregator), Some(sink))
        } else {
            (None, None)
        };

        let reader = ScheduleReader::start(ReaderContext {
            config: config.clone(),
            schedule: schedule.clone(),
            readers,
            transformations: environment.transformations,
            value_filters: environment.value_filters,
            change_filters: Arc::new(ChangeFilterCache::new(environment.change_filters)),
            metrics: environment.metrics,
            aggregator_sink,
            writer_sink,
            token: token.child_token(),
        });

        info!(schedule = %schedule.name, "schedule controller started");

        Ok(Self {
            schedule_name: schedule.name.clone(),
            shutdown_timeout: tuning.shutdown_timeout(),
            token,
            reader,
            aggregator,
            writer,
        })
    }

    pub fn schedule_name(&self) -> &str {
        &self.schedule_name
    }

    /// Whether all stages of the schedule are still running.
    pub fn is_running(&self) -> bool {
        self.reader.is_running()
            && self.aggregator.as_ref().is_none_or(|a| a.is_running())
            && self.writer.is_running()
    }

    /// Stops the schedule: cancels the reader first so no new cycles start,
    /// then waits — bounded by the shutdown budget — for the reader, the
    /// aggregator and the writer to drain and stop, in that order. Stages
    /// still running when the budget expires are aborted rather than
    /// awaited forever.
    pub async fn close(&mut self) {
        info!(schedule = %self.schedule_name, "closing schedule");
        self.reader.close();

        let deadline = Instant::now() + self.shutdown_timeout;

        if !self.reader.wait_until_stopped(remaining(deadline)).await {
            warn!(
                schedule = %self.schedule_name,
                "reader did not stop within the shutdown budget, aborting it"
            );
            self.reader.abort();
        }

        if let Some(aggregator) = &mut self.aggregator
            && !aggregator.wait_until_stopped(remaining(deadline)).await
        {
            warn!(
                schedule = %self.schedule_name,
                "aggregator did not stop within the shutdown budget, aborting it"
            );
            aggregator.abort();
        }

        if !self.writer.wait_until_stopped(remaining(deadline)).await {
            warn!(
                schedule = %self.schedule_name,
                "writer did not stop within the shutdown budget, aborting it"
            );
            self.writer.abort();
        }

        self.token.cancel();
        info!(schedule = %self.schedule_name, "schedule closed");
    }

    /// Blocks until every stage has reached full quiescence.
    pub async fn block_until_stopped(&mut self) {
        self.reader.block_until_stopped().await;
        if let Some(aggregator) = &mut self.aggregator {
            aggregator.block_until_stopped().await;
        }
        self.writer.block_until_stopped().await;
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldgate_core::config::ScheduleConfig;
    use fieldgate_core::data::{DeliveryUnit, SourceReadResult};
    use fieldgate_core::sources::{ReadSink, SourceReadError};
    use fieldgate_core::targets::TargetWriteError;
    use std::collections::HashMap;

    struct IdleSource;

    #[async_trait]
    impl SourceValuesReader for IdleSource {
        async fn read(&self, sink: &ReadSink) -> Result<(), SourceReadError> {
            sink.on_result(SourceReadResult::values(HashMap::new())).await;
            Ok(())
        }
    }

    struct NullTarget;

    #[async_trait]
    impl TargetWriter for NullTarget {
        async fn write_target_data(&self, _data: &DeliveryUnit) -> Result<(), TargetWriteError> {
            Ok(())
        }
    }

    fn config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            schedules: vec![ScheduleConfig {
                name: "line-1".to_string(),
                description: String::new(),
                active: true,
                interval_ms: 50,
                sources: HashMap::from([("press".to_string(), vec!["temp".to_string()])]),
                targets: vec!["historian".to_string()],
                metadata: HashMap::new(),
                timestamp_level: Default::default(),
                aggregation: None,
            }],
            ..Default::default()
        })
    }

    fn environment() -> ScheduleEnvironment {
        ScheduleEnvironment {
            readers: HashMap::from([(
                "press".to_string(),
                Arc::new(IdleSource) as Arc<dyn SourceValuesReader>,
            )]),
            targets: HashMap::from([(
                "historian".to_string(),
                Arc::new(NullTarget) as Arc<dyn TargetWriter>,
            )]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_schedule_is_rejected() {
        let result = ScheduleController::start(config(), "line-9", environment());
        assert!(matches!(result, Err(ConfigError::UnknownSchedule(_))));
    }

    #[tokio::test]
    async fn inactive_schedule_is_rejected() {
        let mut config = config();
        Arc::get_mut(&mut config).unwrap().schedules[0].active = false;
        let result = ScheduleController::start(config, "line-1", environment());
        assert!(matches!(result, Err(ConfigError::InvalidSchedule { .. })));
    }

    #[tokio::test]
    async fn missing_source_wiring_is_rejected() {
        let mut environment = environment();
        environment.readers.clear();
        let result = ScheduleController::start(config(), "line-1", environment);
        assert!(matches!(result, Err(ConfigError::InvalidSchedule { .. })));
    }

    #[tokio::test]
    async fn missing_target_wiring_is_rejected() {
        let mut environment = environment();
        environment.targets.clear();
        let result = ScheduleController::start(config(), "line-1", environment);
        assert!(matches!(result, Err(ConfigError::InvalidSchedule { .. })));
    }

    #[tokio::test]
    async fn controller_starts_and_closes() {
        let mut controller =
            ScheduleController::start(config(), "line-1", environment()).unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.schedule_name(), "line-1");

        controller.close().await;
        assert!(!controller.is_running());
        controller.block_until_stopped().await;
    }
}
