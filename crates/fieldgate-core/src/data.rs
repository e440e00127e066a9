//! Data model for the collection pipeline.
//!
//! Values move through the pipeline in one direction: a source adapter
//! produces [`SourceReadResult`]s, one read cycle combines them into a
//! [`CycleResult`], filtering and transformation turn that into an
//! [`OutputBatch`], and the writer wraps each batch into one
//! [`DeliveryUnit`] shared by all targets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a configured source.
pub type SourceId = String;
/// Identifier of a data point (channel) within a source.
pub type ChannelId = String;
/// Identifier of a configured delivery target.
pub type TargetId = String;

/// A single measurement read from one channel of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    pub value: Value,
    /// Device timestamp, if the adapter provides one. Falls back to the
    /// source read timestamp when output timestamps are built.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChannelValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

/// Outcome of reading one source in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceReadResult {
    /// The adapter produced channel values.
    Values {
        values: HashMap<ChannelId, ChannelValue>,
        timestamp: DateTime<Utc>,
    },
    /// The read failed; the source is excluded from the cycle output.
    Error { message: String },
}

impl SourceReadResult {
    pub fn values(values: HashMap<ChannelId, ChannelValue>) -> Self {
        Self::Values {
            values,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Combined output of one read cycle across all configured sources.
///
/// Built exactly once per cycle, only after every configured source has
/// reported (success, error or nothing) or the cycle timeout elapsed.
pub type CycleResult = HashMap<SourceId, SourceReadResult>;

/// A filtered/transformed channel value ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutputValue {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl ChannelOutputValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
            metadata: None,
        }
    }
}

/// Output of one source after filtering, transformation and, optionally,
/// aggregation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceOutputData {
    pub channels: HashMap<ChannelId, ChannelOutputValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<HashMap<String, String>>,
    pub aggregated: bool,
}

/// What flows on the reader/aggregator → writer channels.
///
/// Invariant: never contains a source entry with zero channels.
pub type OutputBatch = HashMap<SourceId, SourceOutputData>;

/// One delivery of an output batch to the schedule's targets.
///
/// The serial is generated once per batch and shared by every target write
/// derived from it, so acknowledgement and retry handling downstream can
/// correlate attempts. Source and channel keys are display names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub schedule: String,
    pub sources: HashMap<String, SourceOutputData>,
    pub metadata: HashMap<String, String>,
    pub serial: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Outcome class of an out-of-band target acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetResultKind {
    Ack,
    Nack,
    Error,
}

/// Acknowledgement reported asynchronously by a target for one or more
/// delivery serials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub kind: TargetResultKind,
    pub serials: Vec<Uuid>,
}

impl TargetResult {
    pub fn ack(serials: Vec<Uuid>) -> Self {
        Self {
            kind: TargetResultKind::Ack,
            serials,
        }
    }

    pub fn nack(serials: Vec<Uuid>) -> Self {
        Self {
            kind: TargetResultKind::Nack,
            serials,
        }
    }

    pub fn error(serials: Vec<Uuid>) -> Self {
        Self {
            kind: TargetResultKind::Error,
            serials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_read_result_error_classification() {
        let ok = SourceReadResult::values(HashMap::from([(
            "temp".to_string(),
            ChannelValue::new(json!(21.5)),
        )]));
        let err = SourceReadResult::error("device unreachable");
        assert!(!ok.is_error());
        assert!(err.is_error());
    }

    #[test]
    fn delivery_unit_round_trips_through_json() {
        let unit = DeliveryUnit {
            schedule: "line-1".to_string(),
            sources: HashMap::from([(
                "Press".to_string(),
                SourceOutputData {
                    channels: HashMap::from([(
                        "temp".to_string(),
                        ChannelOutputValue::new(json!(21.5)),
                    )]),
                    timestamp: Some(Utc::now()),
                    metadata: None,
                    aggregated: false,
                },
            )]),
            metadata: HashMap::from([("site".to_string(), "plant-7".to_string())]),
            serial: Uuid::new_v4(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&unit).unwrap();
        let back: DeliveryUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(unit, back);
    }
}
