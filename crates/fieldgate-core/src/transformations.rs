//! Per-channel value transformations.
//!
//! Transformations are externally supplied pure functions applied after
//! filtering. The pipeline treats them fail-open: a transformation error is
//! logged and the untransformed value passes through unchanged.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("transformation failed for channel `{channel}`: {message}")]
pub struct TransformError {
    pub channel: String,
    pub message: String,
}

impl TransformError {
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Externally supplied pure transformation of one channel value.
pub trait Transformation: Send + Sync {
    fn invoke(&self, value: Value, channel: &str) -> Result<Value, TransformError>;
}

/// [`Transformation`] adapter for plain closures.
pub struct FnTransformation<F>(pub F);

impl<F> Transformation for FnTransformation<F>
where
    F: Fn(Value, &str) -> Result<Value, TransformError> + Send + Sync,
{
    fn invoke(&self, value: Value, channel: &str) -> Result<Value, TransformError> {
        (self.0)(value, channel)
    }
}
