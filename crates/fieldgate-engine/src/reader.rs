//! Schedule reader: fan-out to source adapters, fan-in to one cycle result.
//!
//! Each cycle, a fresh worker queue runs one read task per configured
//! source; the tasks post their results onto a bounded channel consumed by
//! a long-lived fan-in task that combines them, applies filters and
//! transformations, and forwards the cycle's output downstream. A source
//! that fails or outlasts the cycle timeout costs only itself and only
//! this cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, trace, warn};

use fieldgate_core::channels::ChannelSink;
use fieldgate_core::config::{GatewayConfig, ScheduleConfig, SourceConfig};
use fieldgate_core::data::{
    ChannelId, ChannelOutputValue, ChannelValue, CycleResult, OutputBatch, SourceId,
    SourceOutputData, SourceReadResult,
};
use fieldgate_core::filters::{ChangeFilterCache, Filter};
use fieldgate_core::metrics::{
    METRICS_CORE_SOURCE, METRICS_READ_ERRORS, METRICS_READ_SUCCESS, METRICS_READS,
    METRICS_VALUES_READ, MetricsDataPoint, MetricsSink,
};
use fieldgate_core::sources::{ReadSink, SourceValuesReader};
use fieldgate_core::transformations::Transformation;
use fieldgate_core::worker_queue::{WorkerQueue, WorkerQueueError};

use crate::stage;

/// Wiring for one schedule's reader, assembled by the controller.
pub(crate) struct ReaderContext {
    pub config: Arc<GatewayConfig>,
    pub schedule: Arc<ScheduleConfig>,
    pub readers: HashMap<SourceId, Arc<dyn SourceValuesReader>>,
    pub transformations: HashMap<String, Arc<dyn Transformation>>,
    pub value_filters: HashMap<String, Arc<dyn Filter>>,
    pub change_filters: Arc<ChangeFilterCache>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    /// Destination for cycle outputs when the schedule aggregates.
    pub aggregator_sink: Option<ChannelSink<OutputBatch>>,
    pub writer_sink: ChannelSink<OutputBatch>,
    pub token: CancellationToken,
}

/// Reads input data from the protocol sources of one schedule.
pub struct ScheduleReader {
    token: CancellationToken,
    read_loop: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl ScheduleReader {
    pub(crate) fn start(ctx: ReaderContext) -> Self {
        let tuning = &ctx.config.tuning;
        let (results_tx, results_rx) = mpsc::channel(tuning.reader_results_channel_size);
        let results_sink = ChannelSink::new(
            results_tx,
            "reader results",
            tuning.reader_results_channel_size,
            tuning.reader_results_channel_timeout(),
            tuning.overflow_policy,
        )
        .with_tuning_hints(
            "reader_results_channel_size",
            "reader_results_channel_timeout_ms",
        );

        let processor = CycleProcessor {
            schedule: ctx.schedule.clone(),
            sources: ctx.config.sources.clone(),
            transformations: ctx.transformations,
            value_filters: ctx.value_filters,
            change_filters: ctx.change_filters,
            metrics: ctx.metrics,
            aggregator_sink: ctx.aggregator_sink,
            writer_sink: ctx.writer_sink,
        };

        let consumer = tokio::spawn(run_consumer(
            ReadCombiner::new(ctx.readers.len()),
            processor,
            results_rx,
            ctx.token.clone(),
        ));

        let read_loop = tokio::spawn(run_read_loop(
            ctx.schedule.clone(),
            ctx.readers,
            results_sink,
            tuning.max_concurrent_source_readers,
            tuning.all_sources_read_timeout(),
            ctx.token.clone(),
        ));

        Self {
            token: ctx.token,
            read_loop,
            consumer,
        }
    }

    /// Stops the reader: no new cycles are started, the consumer flushes
    /// what it holds and exits.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.read_loop.is_finished() || !self.consumer.is_finished()
    }

    /// Waits for the reader to stop. Returns whether it stopped within the
    /// timeout.
    pub async fn wait_until_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let read_loop_stopped = stage::stopped_within(&mut self.read_loop, deadline).await;
        let consumer_stopped = stage::stopped_within(&mut self.consumer, deadline).await;
        read_loop_stopped && consumer_stopped
    }

    pub async fn block_until_stopped(&mut self) {
        stage::stopped(&mut self.read_loop).await;
        stage::stopped(&mut self.consumer).await;
    }

    pub(crate) fn abort(&self) {
        self.read_loop.abort();
        self.consumer.abort();
    }
}

type AdapterRead = (SourceId, Arc<dyn SourceValuesReader>);

async fn run_read_loop(
    schedule: Arc<ScheduleConfig>,
    readers: HashMap<SourceId, Arc<dyn SourceValuesReader>>,
    results_sink: ChannelSink<(SourceId, Option<SourceReadResult>)>,
    max_concurrent: usize,
    read_timeout: Duration,
    token: CancellationToken,
) {
    let workers = max_concurrent.min(readers.len()).max(1);
    let mut ticker = tokio::time::interval(schedule.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        schedule = %schedule.name,
        sources = readers.len(),
        workers,
        "schedule reader started"
    );

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A fresh single-shot queue per cycle; abandoning a timed-out cycle
        // drops the queue and its in-flight reads with it.
        let mut queue: WorkerQueue<AdapterRead, ()> = WorkerQueue::new(workers, readers.len(), {
            let results_sink = results_sink.clone();
            let token = token.clone();
            move |(source, adapter): AdapterRead| {
                let results_sink = results_sink.clone();
                let token = token.clone();
                async move {
                    let sink = ReadSink::new(source, results_sink, token);
                    match adapter.read(&sink).await {
                        Ok(()) => {
                            if !sink.delivered() {
                                sink.mark_done().await;
                            }
                        }
                        Err(e) => {
                            sink.on_result(SourceReadResult::error(e.to_string())).await;
                        }
                    }
                    Ok(())
                }
            }
        });

        for (source, adapter) in &readers {
            queue.submit((source.clone(), adapter.clone())).await;
        }

        tokio::select! {
            biased;

            _ = token.cancelled() => break,
            drained = queue.await_results(read_timeout) => {
                if let Err(WorkerQueueError::Timeout { expected, received, .. }) = drained {
                    warn!(
                        schedule = %schedule.name,
                        expected,
                        received,
                        timeout_ms = read_timeout.as_millis() as u64,
                        "read cycle timed out, abandoning cycle"
                    );
                }
            }
        }
    }

    info!(schedule = %schedule.name, "schedule reader stopped");
}

async fn run_consumer(
    mut combiner: ReadCombiner,
    processor: CycleProcessor,
    mut results_rx: mpsc::Receiver<(SourceId, Option<SourceReadResult>)>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,
            received = results_rx.recv() => {
                let Some((source, result)) = received else { break };
                for cycle in combiner.offer(source, result) {
                    processor.process(cycle).await;
                }
            }
        }
    }

    // Flush what the interrupted cycle accumulated so shutdown does not
    // silently discard in-flight data.
    if let Some(cycle) = combiner.take() {
        processor.process(cycle).await;
    }
}

/// Fan-in barrier state: combined results and the set of sources heard
/// from this cycle. Mutated by the consumer task only.
struct ReadCombiner {
    expected: usize,
    combined: CycleResult,
    done: HashSet<SourceId>,
}

impl ReadCombiner {
    fn new(expected: usize) -> Self {
        Self {
            expected: expected.max(1),
            combined: CycleResult::new(),
            done: HashSet::new(),
        }
    }

    /// Records one source report and returns the cycle results that became
    /// ready to flush because of it.
    ///
    /// A `None` result marks the source done without a value. A source
    /// reporting while already marked done is the start of the next cycle:
    /// the previous combined result is flushed first, capping staleness at
    /// one cycle.
    fn offer(&mut self, source: SourceId, result: Option<SourceReadResult>) -> Vec<CycleResult> {
        let mut flushes = Vec::new();

        if self.done.contains(&source)
            && let Some(previous) = self.take()
        {
            flushes.push(previous);
        }

        self.done.insert(source.clone());
        if let Some(result) = result {
            self.combined.insert(source, result);
        }

        if self.done.len() >= self.expected
            && let Some(complete) = self.take()
        {
            flushes.push(complete);
        }

        flushes
    }

    /// Takes the combined result and resets the cycle state. Returns `None`
    /// when nothing was combined (every source reported without a value).
    fn take(&mut self) -> Option<CycleResult> {
        self.done.clear();
        if self.combined.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.combined))
        }
    }
}

type SourceValues = HashMap<SourceId, (HashMap<ChannelId, ChannelValue>, DateTime<Utc>)>;

/// Post-combine processing: drop failed sources, filter, transform, build
/// the output batch and hand it downstream.
struct CycleProcessor {
    schedule: Arc<ScheduleConfig>,
    sources: HashMap<SourceId, SourceConfig>,
    transformations: HashMap<String, Arc<dyn Transformation>>,
    value_filters: HashMap<String, Arc<dyn Filter>>,
    change_filters: Arc<ChangeFilterCache>,
    metrics: Option<Arc<dyn MetricsSink>>,
    aggregator_sink: Option<ChannelSink<OutputBatch>>,
    writer_sink: ChannelSink<OutputBatch>,
}

impl CycleProcessor {
    async fn process(&self, cycle: CycleResult) {
        let mut datapoints = vec![MetricsDataPoint::count(METRICS_READS, 1)];

        let mut successes: SourceValues = HashMap::with_capacity(cycle.len());
        let mut read_errors = 0u64;
        for (source, result) in cycle {
            match result {
                SourceReadResult::Error { message } => {
                    error!(
                        schedule = %self.schedule.name,
                        source = %source,
                        message,
                        "error reading from source"
                    );
                    read_errors += 1;
                }
                SourceReadResult::Values { values, timestamp } => {
                    successes.insert(source, (values, timestamp));
                }
            }
        }

        if read_errors > 0 {
            datapoints.push(MetricsDataPoint::count(METRICS_READ_ERRORS, read_errors));
        } else {
            datapoints.push(MetricsDataPoint::count(METRICS_READ_SUCCESS, 1));
        }

        let filtered = self.apply_filters(successes);
        let transformed = self.apply_transformations(filtered).await;
        let output = self.build_output(transformed);

        if !output.is_empty() {
            let values_read: u64 = output.values().map(|data| data.channels.len() as u64).sum();
            let delivered = match &self.aggregator_sink {
                Some(aggregator) => aggregator.submit(output).await,
                None => self.writer_sink.submit(output).await,
            };
            if delivered {
                datapoints.push(MetricsDataPoint::count(METRICS_VALUES_READ, values_read));
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.put(METRICS_CORE_SOURCE, datapoints);
        }
    }

    fn apply_filters(&self, data: SourceValues) -> SourceValues {
        if self.change_filters.is_empty() && self.value_filters.is_empty() {
            return data;
        }

        data.into_iter()
            .filter_map(|(source, (values, timestamp))| {
                let filtered: HashMap<ChannelId, ChannelValue> = values
                    .into_iter()
                    .filter(|(channel, value)| self.passes_filters(&source, channel, &value.value))
                    .collect();

                // Sources with no channel values left after filtering are
                // dropped from the cycle output.
                if filtered.is_empty() {
                    None
                } else {
                    Some((source, (filtered, timestamp)))
                }
            })
            .collect()
    }

    fn passes_filters(&self, source: &str, channel: &str, value: &serde_json::Value) -> bool {
        let channel_config = self
            .sources
            .get(source)
            .and_then(|s| s.channels.get(channel));

        if let Some(filter_id) = channel_config.and_then(|c| c.change_filter.as_deref())
            && !self.change_filters.apply(filter_id, source, channel, value)
        {
            trace!(source, channel, filter = filter_id, "value filtered out by change filter");
            return false;
        }

        if let Some(filter_id) = channel_config.and_then(|c| c.value_filter.as_deref())
            && let Some(filter) = self.value_filters.get(filter_id)
            && !filter.apply(value)
        {
            trace!(source, channel, filter = filter_id, "value filtered out by value filter");
            return false;
        }

        true
    }

    async fn apply_transformations(&self, data: SourceValues) -> SourceValues {
        if self.transformations.is_empty() {
            return data;
        }

        // Synchronous evaluation under trace logging keeps per-value log
        // ordering deterministic.
        let trace_enabled = tracing::enabled!(Level::TRACE);

        let mut out: SourceValues = HashMap::with_capacity(data.len());
        for (source, (values, timestamp)) in data {
            let mut transformed: HashMap<ChannelId, ChannelValue> =
                HashMap::with_capacity(values.len());
            let mut pending: Vec<(ChannelId, ChannelValue, Arc<dyn Transformation>)> = Vec::new();

            for (channel, value) in values {
                match self.transformation_for(&source, &channel) {
                    Some(transformation) if trace_enabled => {
                        let result =
                            transform_one(&source, &channel, value, transformation.as_ref());
                        trace!(
                            source = %source,
                            channel = %channel,
                            value = %result.value,
                            "transformed channel value"
                        );
                        transformed.insert(channel, result);
                    }
                    Some(transformation) => pending.push((channel, value, transformation)),
                    None => {
                        transformed.insert(channel, value);
                    }
                }
            }

            if !pending.is_empty() {
                let concurrent = pending.into_iter().map(|(channel, value, transformation)| {
                    let source = source.clone();
                    let original = value.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        let result =
                            transform_one(&source, &channel, value, transformation.as_ref());
                        (channel, result)
                    });
                    async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => {
                                error!(error = %e, "transformation task failed");
                                (String::new(), original)
                            }
                        }
                    }
                });

                for (channel, value) in futures::future::join_all(concurrent).await {
                    if !channel.is_empty() {
                        transformed.insert(channel, value);
                    }
                }
            }

            out.insert(source, (transformed, timestamp));
        }
        out
    }

    fn transformation_for(&self, source: &str, channel: &str) -> Option<Arc<dyn Transformation>> {
        let id = self
            .sources
            .get(source)?
            .channels
            .get(channel)?
            .transformation
            .as_ref()?;
        self.transformations.get(id).cloned()
    }

    /// Combines the channel values with timestamps and channel metadata
    /// according to the schedule's timestamp level.
    fn build_output(&self, data: SourceValues) -> OutputBatch {
        let level = self.schedule.timestamp_level;

        data.into_iter()
            .filter_map(|(source, (values, source_timestamp))| {
                let mut channels: HashMap<ChannelId, ChannelOutputValue> =
                    HashMap::with_capacity(values.len());

                for (channel, value) in values {
                    if value.value.is_null() {
                        continue;
                    }
                    let timestamp = level
                        .channel_timestamp()
                        .then(|| value.timestamp.unwrap_or(source_timestamp));
                    let metadata = self
                        .sources
                        .get(&source)
                        .and_then(|s| s.channels.get(&channel))
                        .map(|c| c.metadata.clone())
                        .filter(|m| !m.is_empty());

                    channels.insert(
                        channel,
                        ChannelOutputValue {
                            value: value.value,
                            timestamp,
                            metadata,
                        },
                    );
                }

                if channels.is_empty() {
                    return None;
                }

                trace!(
                    schedule = %self.schedule.name,
                    source = %source,
                    channels = channels.len(),
                    "cycle output built for source"
                );

                Some((
                    source,
                    SourceOutputData {
                        channels,
                        timestamp: level.source_timestamp().then_some(source_timestamp),
                        metadata: None,
                        aggregated: false,
                    },
                ))
            })
            .collect()
    }
}

fn transform_one(
    source: &str,
    channel: &str,
    value: ChannelValue,
    transformation: &dyn Transformation,
) -> ChannelValue {
    match transformation.invoke(value.value.clone(), channel) {
        Ok(new_value) => ChannelValue {
            value: new_value,
            timestamp: value.timestamp,
        },
        Err(e) => {
            // Fail open: the untransformed value passes through.
            error!(
                source,
                channel,
                error = %e,
                "transformation failed, passing original value"
            );
            value
        }
    }
}
