//! Schedule aggregator: turns a stream of per-cycle outputs into
//! less-frequent, larger batches.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use fieldgate_core::aggregations::{AggregationFn, Aggregator};
use fieldgate_core::channels::ChannelSink;
use fieldgate_core::data::OutputBatch;

use crate::stage;

/// Accumulates cycle outputs for one schedule and emits an aggregated
/// batch every `aggregation_size` cycles. Only instantiated when the
/// schedule configuration declares aggregation; stops when its input
/// channel closes.
pub struct ScheduleAggregator {
    worker: JoinHandle<()>,
}

impl ScheduleAggregator {
    pub(crate) fn start(
        schedule_name: String,
        aggregation_size: usize,
        aggregation: AggregationFn,
        input: mpsc::Receiver<OutputBatch>,
        writer_sink: ChannelSink<OutputBatch>,
    ) -> Self {
        let worker = tokio::spawn(run_aggregation(
            schedule_name,
            aggregation_size,
            aggregation,
            input,
            writer_sink,
        ));
        Self { worker }
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Waits for the aggregator to stop. Returns whether it stopped within
    /// the timeout.
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

async fn run_aggregation(
    schedule_name: String,
    aggregation_size: usize,
    aggregation: AggregationFn,
    mut input: mpsc::Receiver<OutputBatch>,
    writer_sink: ChannelSink<OutputBatch>,
) {
    let mut aggregator = Aggregator::new();
    info!(
        schedule = %schedule_name,
        size = aggregation_size,
        "schedule aggregator started"
    );

    while let Some(batch) = input.recv().await {
        let cycles = aggregator.add(&batch);
        trace!(
            schedule = %schedule_name,
            cycles,
            size = aggregation_size,
            "cycle output accumulated"
        );

        if cycles >= aggregation_size {
            let aggregated = aggregator.aggregate(&aggregation);
            if !aggregated.is_empty() {
                debug!(
                    schedule = %schedule_name,
                    sources = aggregated.len(),
                    "emitting aggregated batch"
                );
                writer_sink.submit(aggregated).await;
            }
        }
    }

    info!(schedule = %schedule_name, "schedule aggregator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::aggregations::builtin;
    use fieldgate_core::channels::OverflowPolicy;
    use fieldgate_core::data::{ChannelOutputValue, SourceOutputData};
    use serde_json::json;
    use std::collections::HashMap;

    fn batch(value: f64) -> OutputBatch {
        HashMap::from([(
            "press".to_string(),
            SourceOutputData {
                channels: HashMap::from([(
                    "temp".to_string(),
                    ChannelOutputValue::new(json!(value)),
                )]),
                timestamp: None,
                metadata: None,
                aggregated: false,
            },
        )])
    }

    #[tokio::test]
    async fn emits_one_batch_per_aggregation_size_cycles() {
        let (input_tx, input_rx) = mpsc::channel(8);
        let (writer_tx, mut writer_rx) = mpsc::channel(8);
        let writer_sink = ChannelSink::new(
            writer_tx,
            "writer input",
            8,
            Duration::from_millis(100),
            OverflowPolicy::Block,
        );

        let mut aggregator = ScheduleAggregator::start(
            "test".to_string(),
            3,
            builtin("avg").unwrap(),
            input_rx,
            writer_sink,
        );

        for value in [1.0, 2.0, 3.0] {
            input_tx.send(batch(value)).await.unwrap();
        }

        let aggregated = writer_rx.recv().await.unwrap();
        let data = &aggregated["press"];
        assert!(data.aggregated);
        assert_eq!(data.channels["temp"].value, json!(2.0));

        // Accumulator reset: the next window aggregates on its own.
        for value in [4.0, 5.0, 6.0] {
            input_tx.send(batch(value)).await.unwrap();
        }
        let aggregated = writer_rx.recv().await.unwrap();
        assert_eq!(aggregated["press"].channels["temp"].value, json!(5.0));

        drop(input_tx);
        assert!(aggregator.wait_until_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn emits_nothing_below_the_threshold() {
        let (input_tx, input_rx) = mpsc::channel(8);
        let (writer_tx, mut writer_rx) = mpsc::channel(8);
        let writer_sink = ChannelSink::new(
            writer_tx,
            "writer input",
            8,
            Duration::from_millis(100),
            OverflowPolicy::Block,
        );

        let mut aggregator = ScheduleAggregator::start(
            "test".to_string(),
            5,
            builtin("count").unwrap(),
            input_rx,
            writer_sink,
        );

        for value in [1.0, 2.0, 3.0, 4.0] {
            input_tx.send(batch(value)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writer_rx.try_recv().is_err());

        drop(input_tx);
        assert!(aggregator.wait_until_stopped(Duration::from_secs(1)).await);
    }
}
