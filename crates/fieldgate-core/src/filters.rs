//! Value and change filters applied to channel values before output.
//!
//! A value failing a filter is silently dropped from the cycle output; a
//! drop is not an error.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::data::{ChannelId, SourceId};

/// Externally supplied value predicate.
pub trait Filter: Send + Sync {
    fn apply(&self, value: &Value) -> bool;
}

/// [`Filter`] adapter for plain closures.
pub struct FnFilter<F>(pub F);

impl<F> Filter for FnFilter<F>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn apply(&self, value: &Value) -> bool {
        (self.0)(value)
    }
}

/// Change-filter settings for one filter ID.
///
/// A value passes when any of the following holds: there is no previous
/// passed value for the channel, the numeric delta to the previous passed
/// value reaches `min_delta` or `min_percent`, the value is non-numeric
/// and differs from the previous one, or `at_least_every_ms` elapsed since
/// the last pass. With no criteria configured, any changed value passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeFilterConfig {
    /// Minimum absolute change to the last passed value.
    pub min_delta: Option<f64>,
    /// Minimum change as a percentage of the last passed value.
    pub min_percent: Option<f64>,
    /// Pass unconditionally when this many milliseconds elapsed since the
    /// last passed value.
    pub at_least_every_ms: Option<u64>,
}

impl ChangeFilterConfig {
    fn passes(&self, previous: &Value, previous_at: DateTime<Utc>, next: &Value) -> bool {
        if let Some(interval_ms) = self.at_least_every_ms {
            let elapsed = Utc::now() - previous_at;
            if elapsed >= ChronoDuration::milliseconds(interval_ms as i64) {
                return true;
            }
        }

        match (previous.as_f64(), next.as_f64()) {
            (Some(previous), Some(next)) => {
                let delta = (next - previous).abs();
                if let Some(min_delta) = self.min_delta {
                    return delta >= min_delta;
                }
                if let Some(min_percent) = self.min_percent {
                    return delta >= previous.abs() * min_percent / 100.0;
                }
                delta != 0.0
            }
            // Non-numeric values pass on any change.
            _ => previous != next,
        }
    }
}

#[derive(Debug, Clone)]
struct LastPassed {
    value: Value,
    at: DateTime<Utc>,
}

/// Stateful change-filter store for one schedule.
///
/// Keeps the last passed value per `(source, channel)`; state is only
/// updated when a value passes, so a slow drift below the threshold keeps
/// being measured against the last reported value.
pub struct ChangeFilterCache {
    filters: HashMap<String, ChangeFilterConfig>,
    last_passed: DashMap<(SourceId, ChannelId), LastPassed>,
}

impl ChangeFilterCache {
    pub fn new(filters: HashMap<String, ChangeFilterConfig>) -> Self {
        Self {
            filters,
            last_passed: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Applies the named filter to one channel value. Unknown filter IDs
    /// pass everything.
    pub fn apply(&self, filter_id: &str, source: &str, channel: &str, value: &Value) -> bool {
        let Some(config) = self.filters.get(filter_id) else {
            return true;
        };

        let key = (source.to_string(), channel.to_string());
        let passes = match self.last_passed.get(&key) {
            Some(previous) => config.passes(&previous.value, previous.at, value),
            None => true,
        };

        if passes {
            self.last_passed.insert(
                key,
                LastPassed {
                    value: value.clone(),
                    at: Utc::now(),
                },
            );
        }
        passes
    }
}
