//! Schedule writer: fan-out of finalized batches to the delivery targets.
//!
//! Every batch becomes one delivery unit with a fresh serial shared by all
//! targets, written concurrently with one individually-timed attempt per
//! target. A target's failure or timeout costs only that target's copy of
//! the batch; nothing is retried at this layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use fieldgate_core::config::{GatewayConfig, ScheduleConfig, SourceConfig};
use fieldgate_core::data::{DeliveryUnit, OutputBatch, SourceId, SourceOutputData, TargetId};
use fieldgate_core::metrics::{
    METRICS_CORE_SOURCE, METRICS_MESSAGES, METRICS_WRITE_ERRORS, METRICS_WRITE_SUCCESS,
    METRICS_WRITES, MetricsDataPoint, MetricsSink,
};
use fieldgate_core::targets::TargetWriter;

use crate::stage;

/// Margin on top of the per-target timeout for the batch-level wait, so the
/// individual timeouts settle first.
const BATCH_WAIT_MARGIN: Duration = Duration::from_millis(500);

/// Wiring for one schedule's writer, assembled by the controller.
pub(crate) struct WriterContext {
    pub config: Arc<GatewayConfig>,
    pub schedule: Arc<ScheduleConfig>,
    pub targets: HashMap<TargetId, Arc<dyn TargetWriter>>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    pub input: mpsc::Receiver<OutputBatch>,
}

/// Writes output data to the targets of one schedule.
pub struct ScheduleWriter {
    worker: JoinHandle<()>,
}

impl ScheduleWriter {
    pub(crate) fn start(ctx: WriterContext) -> Self {
        let worker = tokio::spawn(run_write_loop(ctx));
        Self { worker }
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Waits for the writer to drain and stop. Returns whether it stopped
    /// within the timeout.
    pub async fn wait_until_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        stage::stopped_within(&mut self.worker, deadline).await
    }

    pub async fn block_until_stopped(&mut self) {
        stage::stopped(&mut self.worker).await;
    }

    pub(crate) fn abort(&self) {
        self.worker.abort();
    }
}

async fn run_write_loop(mut ctx: WriterContext) {
    let schedule = ctx.schedule.clone();

    if ctx.targets.is_empty() {
        error!(schedule = %schedule.name, "no active targets for schedule");
        return;
    }

    info!(
        schedule = %schedule.name,
        targets = ctx.targets.len(),
        "schedule writer started"
    );

    let per_target_timeout = ctx.config.tuning.per_target_write_timeout();
    while let Some(batch) = ctx.input.recv().await {
        write_batch(&ctx, batch, per_target_timeout).await;
    }

    // Input channel closed by the upstream stages: close all targets.
    futures::future::join_all(ctx.targets.values().map(|target| target.close())).await;
    info!(schedule = %schedule.name, "schedule writer stopped");
}

async fn write_batch(ctx: &WriterContext, batch: OutputBatch, per_target_timeout: Duration) {
    let mut metadata = ctx.config.metadata.clone();
    metadata.extend(ctx.schedule.metadata.clone());

    let unit = DeliveryUnit {
        schedule: ctx.schedule.name.clone(),
        sources: map_to_named(batch, &ctx.config.sources),
        metadata,
        serial: Uuid::new_v4(),
        timestamp: Utc::now(),
    };

    let mut writes = JoinSet::new();
    for (target_id, target) in &ctx.targets {
        let target_id = target_id.clone();
        let target = target.clone();
        let unit = unit.clone();
        writes.spawn(async move {
            write_to_target(&target_id, target.as_ref(), &unit, per_target_timeout).await
        });
    }

    let total = writes.len() as u64;
    let mut successes = 0u64;
    let deadline = tokio::time::Instant::now() + per_target_timeout + BATCH_WAIT_MARGIN;

    loop {
        match tokio::time::timeout_at(deadline, writes.join_next()).await {
            Ok(Some(Ok(succeeded))) => {
                if succeeded {
                    successes += 1;
                }
            }
            Ok(Some(Err(e))) => {
                error!(schedule = %ctx.schedule.name, error = %e, "target write task failed");
            }
            Ok(None) => break,
            Err(_) => {
                error!(
                    schedule = %ctx.schedule.name,
                    pending = writes.len(),
                    "timeout waiting for target writes"
                );
                writes.abort_all();
                break;
            }
        }
    }

    if let Some(metrics) = &ctx.metrics {
        let mut datapoints = vec![
            MetricsDataPoint::count(METRICS_MESSAGES, 1),
            MetricsDataPoint::count(METRICS_WRITES, total),
        ];
        if successes > 0 {
            datapoints.push(MetricsDataPoint::count(METRICS_WRITE_SUCCESS, successes));
        }
        if successes < total {
            datapoints.push(MetricsDataPoint::count(
                METRICS_WRITE_ERRORS,
                total - successes,
            ));
        }
        metrics.put(METRICS_CORE_SOURCE, datapoints);
    }
}

/// One delivery attempt for one target. Succeeds only when the target
/// reports itself initialized and the write completes in time without an
/// error.
async fn write_to_target(
    target_id: &str,
    target: &dyn TargetWriter,
    unit: &DeliveryUnit,
    timeout: Duration,
) -> bool {
    trace!(target = target_id, serial = %unit.serial, "writing to target");

    if !target.is_initialized() {
        warn!(
            target = target_id,
            "cannot write to target, it has not been initialized yet"
        );
        return false;
    }

    match tokio::time::timeout(timeout, target.write_target_data(unit)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(target = target_id, error = %e, "error writing to target");
            false
        }
        Err(_) => {
            error!(
                target = target_id,
                timeout_ms = timeout.as_millis() as u64,
                "timeout writing to target"
            );
            false
        }
    }
}

/// Maps internal source and channel IDs to their configured display names
/// and attaches source metadata.
fn map_to_named(
    batch: OutputBatch,
    sources: &HashMap<SourceId, SourceConfig>,
) -> HashMap<String, SourceOutputData> {
    batch
        .into_iter()
        .map(|(source_id, data)| {
            let source_config = sources.get(&source_id);
            let source_name = source_config
                .and_then(|s| s.name.clone())
                .unwrap_or_else(|| source_id.clone());

            let channels = data
                .channels
                .into_iter()
                .map(|(channel_id, value)| {
                    let channel_name = source_config
                        .and_then(|s| s.channels.get(&channel_id))
                        .and_then(|c| c.name.clone())
                        .unwrap_or(channel_id);
                    (channel_name, value)
                })
                .collect();

            let metadata = source_config
                .map(|s| s.metadata.clone())
                .filter(|m| !m.is_empty());

            (
                source_name,
                SourceOutputData {
                    channels,
                    timestamp: data.timestamp,
                    metadata,
                    aggregated: data.aggregated,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::config::ChannelConfig;
    use fieldgate_core::data::ChannelOutputValue;
    use serde_json::json;

    #[test]
    fn display_names_replace_internal_ids() {
        let sources = HashMap::from([(
            "src-001".to_string(),
            SourceConfig {
                name: Some("Press".to_string()),
                metadata: HashMap::from([("line".to_string(), "1".to_string())]),
                channels: HashMap::from([(
                    "ch-001".to_string(),
                    ChannelConfig {
                        name: Some("Temperature".to_string()),
                        ..Default::default()
                    },
                )]),
            },
        )]);

        let batch: OutputBatch = HashMap::from([(
            "src-001".to_string(),
            SourceOutputData {
                channels: HashMap::from([(
                    "ch-001".to_string(),
                    ChannelOutputValue::new(json!(21.5)),
                )]),
                timestamp: None,
                metadata: None,
                aggregated: false,
            },
        )]);

        let named = map_to_named(batch, &sources);
        let data = &named["Press"];
        assert_eq!(data.channels["Temperature"].value, json!(21.5));
        assert_eq!(data.metadata.as_ref().unwrap()["line"], "1");
    }

    #[test]
    fn unnamed_entries_keep_their_ids() {
        let batch: OutputBatch = HashMap::from([(
            "press".to_string(),
            SourceOutputData {
                channels: HashMap::from([("temp".to_string(), ChannelOutputValue::new(json!(1)))]),
                timestamp: None,
                metadata: None,
                aggregated: false,
            },
        )]);

        let named = map_to_named(batch, &HashMap::new());
        assert!(named.contains_key("press"));
        assert!(named["press"].channels.contains_key("temp"));
        assert!(named["press"].metadata.is_none());
    }
}
