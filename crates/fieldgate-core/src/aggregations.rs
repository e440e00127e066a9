//! Accumulation and collapse of successive cycle outputs.
//!
//! The [`Aggregator`] buffers channel values per source and channel across
//! cycles; once the schedule's aggregation size is reached the pipeline
//! collapses the buffers with an [`AggregationFn`] into one batch marked
//! aggregated and the accumulator starts over.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::data::{ChannelId, ChannelOutputValue, OutputBatch, SourceId, SourceOutputData};

/// Collapses the values accumulated for one channel into a single output
/// value. Externally supplied; see [`builtin`] for the standard outputs.
pub type AggregationFn =
    Arc<dyn Fn(&SourceId, &ChannelId, &[ChannelOutputValue]) -> ChannelOutputValue + Send + Sync>;

/// Per-source/channel accumulation of cycle outputs.
#[derive(Debug, Default)]
pub struct Aggregator {
    buffers: HashMap<SourceId, HashMap<ChannelId, Vec<ChannelOutputValue>>>,
    cycles: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one cycle's output and returns the number of cycles
    /// accumulated since the last [`Aggregator::aggregate`].
    pub fn add(&mut self, batch: &OutputBatch) -> usize {
        for (source, data) in batch {
            if data.channels.is_empty() {
                continue;
            }
            let source_buffers = self.buffers.entry(source.clone()).or_default();
            for (channel, value) in &data.channels {
                source_buffers
                    .entry(channel.clone())
                    .or_default()
                    .push(value.clone());
            }
        }
        self.cycles += 1;
        self.cycles
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Collapses the accumulated values into one aggregated batch and
    /// clears the accumulator.
    pub fn aggregate(&mut self, aggregation: &AggregationFn) -> OutputBatch {
        let buffers = std::mem::take(&mut self.buffers);
        self.cycles = 0;

        buffers
            .into_iter()
            .filter_map(|(source, channels)| {
                let collapsed: HashMap<ChannelId, ChannelOutputValue> = channels
                    .into_iter()
                    .filter(|(_, values)| !values.is_empty())
                    .map(|(channel, values)| {
                        let value = aggregation(&source, &channel, &values);
                        (channel, value)
                    })
                    .collect();

                if collapsed.is_empty() {
                    None
                } else {
                    Some((
                        source,
                        SourceOutputData {
                            channels: collapsed,
                            timestamp: None,
                            metadata: None,
                            aggregated: true,
                        },
                    ))
                }
            })
            .collect()
    }
}

fn numeric(values: &[ChannelOutputValue]) -> impl Iterator<Item = f64> {
    values.iter().filter_map(|v| v.value.as_f64())
}

fn last_timestamp(values: &[ChannelOutputValue]) -> Option<chrono::DateTime<chrono::Utc>> {
    values.iter().rev().find_map(|v| v.timestamp)
}

fn output(value: Value, values: &[ChannelOutputValue]) -> ChannelOutputValue {
    ChannelOutputValue {
        value,
        timestamp: last_timestamp(values),
        metadata: None,
    }
}

/// Standard aggregation outputs by name: `avg`, `min`, `max`, `sum`,
/// `count`, `first`, `last` over the numeric values of a channel, and
/// `values` for the raw accumulated list. Unknown names return `None`.
pub fn builtin(name: &str) -> Option<AggregationFn> {
    let aggregation: AggregationFn = match name {
        "avg" => Arc::new(|_, _, values| {
            let numbers: Vec<f64> = numeric(values).collect();
            let avg = if numbers.is_empty() {
                Value::Null
            } else {
                json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            };
            output(avg, values)
        }),
        "min" => Arc::new(|_, _, values| {
            let min = numeric(values).fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            });
            output(min.map_or(Value::Null, |v| json!(v)), values)
        }),
        "max" => Arc::new(|_, _, values| {
            let max = numeric(values).fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            });
            output(max.map_or(Value::Null, |v| json!(v)), values)
        }),
        "sum" => Arc::new(|_, _, values| output(json!(numeric(values).sum::<f64>()), values)),
        "count" => Arc::new(|_, _, values| output(json!(values.len()), values)),
        "first" => Arc::new(|_, _, values| {
            values
                .first()
                .cloned()
                .unwrap_or_else(|| ChannelOutputValue::new(Value::Null))
        }),
        "last" => Arc::new(|_, _, values| {
            values
                .last()
                .cloned()
                .unwrap_or_else(|| ChannelOutputValue::new(Value::Null))
        }),
        "values" => Arc::new(|_, _, values| {
            let raw: Vec<Value> = values.iter().map(|v| v.value.clone()).collect();
            output(Value::Array(raw), values)
        }),
        _ => return None,
    };
    Some(aggregation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(source: &str, channel: &str, value: f64) -> OutputBatch {
        HashMap::from([(
            source.to_string(),
            SourceOutputData {
                channels: HashMap::from([(
                    channel.to_string(),
                    ChannelOutputValue::new(json!(value)),
                )]),
                timestamp: None,
                metadata: None,
                aggregated: false,
            },
        )])
    }

    #[test]
    fn add_counts_cycles() {
        let mut aggregator = Aggregator::new();
        assert_eq!(aggregator.add(&batch("press", "temp", 1.0)), 1);
        assert_eq!(aggregator.add(&batch("press", "temp", 2.0)), 2);
        assert_eq!(aggregator.add(&batch("press", "temp", 3.0)), 3);
        assert_eq!(aggregator.cycles(), 3);
    }

    #[test]
    fn aggregate_collapses_and_resets() {
        let mut aggregator = Aggregator::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            aggregator.add(&batch("press", "temp", v));
        }

        let avg = builtin("avg").unwrap();
        let out = aggregator.aggregate(&avg);

        let data = &out["press"];
        assert!(data.aggregated);
        assert_eq!(data.channels["temp"].value, json!(2.5));

        assert!(aggregator.is_empty());
        assert_eq!(aggregator.cycles(), 0);
    }

    #[test]
    fn builtin_outputs() {
        let values: Vec<ChannelOutputValue> = [10.0, 30.0, 20.0]
            .iter()
            .map(|v| ChannelOutputValue::new(json!(v)))
            .collect();

        let expect = |name: &str, expected: Value| {
            let f = builtin(name).unwrap();
            let out = f(&"s".to_string(), &"c".to_string(), &values);
            assert_eq!(out.value, expected, "aggregation `{name}`");
        };

        expect("avg", json!(20.0));
        expect("min", json!(10.0));
        expect("max", json!(30.0));
        expect("sum", json!(60.0));
        expect("count", json!(3));
        expect("first", json!(10.0));
        expect("last", json!(20.0));
        expect("values", json!([10.0, 30.0, 20.0]));
        assert!(builtin("median").is_none());
    }

    #[test]
    fn sources_and_channels_accumulate_separately() {
        let mut aggregator = Aggregator::new();
        aggregator.add(&batch("press", "temp", 1.0));
        aggregator.add(&batch("mill", "rpm", 100.0));

        let count = builtin("count").unwrap();
        let out = aggregator.aggregate(&count);

        assert_eq!(out["press"].channels["temp"].value, json!(1));
        assert_eq!(out["mill"].channels["rpm"].value, json!(1));
    }
}
