//! Contract implemented by delivery targets.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::{DeliveryUnit, TargetId, TargetResult};

#[derive(Debug, Clone, Error)]
pub enum TargetWriteError {
    #[error("target not initialized")]
    NotInitialized,

    #[error("target write failed: {0}")]
    Write(String),
}

impl TargetWriteError {
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write(message.into())
    }
}

/// One delivery target for a schedule's output.
///
/// The pipeline performs exactly one `write_target_data` attempt per batch
/// per target; buffering, retry and acknowledgement-driven redelivery are
/// the implementation's own responsibility.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    async fn write_target_data(&self, data: &DeliveryUnit) -> Result<(), TargetWriteError>;

    /// Whether the target is ready to accept writes. A write attempted
    /// while uninitialized counts as failed.
    fn is_initialized(&self) -> bool {
        true
    }

    /// Out-of-band acknowledgement hook for targets that confirm deliveries
    /// asynchronously, correlated by serial.
    async fn handle_result(&self, _result: TargetResult) {}

    /// Releases the target's resources when its schedule drains.
    async fn close(&self) {}
}

/// Resolved target factory supplied at wiring time, in place of any dynamic
/// plugin loading.
pub type TargetWriterFactory =
    Arc<dyn Fn(&TargetId) -> Result<Arc<dyn TargetWriter>, TargetWriteError> + Send + Sync>;
