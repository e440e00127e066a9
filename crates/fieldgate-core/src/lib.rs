//! # Fieldgate Core
//!
//! Common substrate for the fieldgate data-collection pipeline: the data
//! model that flows between pipeline stages, configuration types, the
//! bounded-channel submit helper, a single-shot worker queue, single-flight
//! memoizing caches, value filters and transformations, aggregation
//! buffers, and the collaborator contracts implemented by protocol source
//! adapters and delivery targets.

pub mod aggregations;
pub mod cache;
pub mod channels;
pub mod config;
pub mod data;
pub mod filters;
pub mod metrics;
pub mod sources;
pub mod targets;
pub mod transformations;
pub mod worker_queue;

pub use aggregations::{AggregationFn, Aggregator};
pub use cache::{CacheError, ItemCache, LookupCache};
pub use channels::{ChannelSink, OverflowPolicy, SubmitEvent};
pub use filters::{ChangeFilterCache, ChangeFilterConfig, Filter, FnFilter};
pub use config::{
    AggregationConfig, ChannelConfig, ConfigError, GatewayConfig, ScheduleConfig, SourceConfig,
    TimestampLevel, TuningConfig,
};
pub use data::{
    ChannelId, ChannelOutputValue, ChannelValue, CycleResult, DeliveryUnit, OutputBatch, SourceId,
    SourceOutputData, SourceReadResult, TargetId, TargetResult, TargetResultKind,
};
pub use metrics::{MetricUnits, MetricsCollector, MetricsDataPoint, MetricsSink};
pub use sources::{ReadSink, SourceReadError, SourceReaderFactory, SourceValuesReader};
pub use targets::{TargetWriteError, TargetWriter, TargetWriterFactory};
pub use transformations::{FnTransformation, TransformError, Transformation};
pub use worker_queue::{WorkerQueue, WorkerQueueError};
