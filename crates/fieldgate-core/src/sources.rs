//! Contract implemented by protocol source adapters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelSink;
use crate::config::SourceConfig;
use crate::data::{SourceId, SourceReadResult};

#[derive(Debug, Clone, Error)]
#[error("source read failed: {0}")]
pub struct SourceReadError(pub String);

impl SourceReadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Sink handed to a source adapter for one read cycle.
///
/// The adapter calls [`ReadSink::on_result`] when it has data or an error;
/// the returned flag is `false` once the schedule is stopping, at which
/// point a looping adapter must stop emitting.
pub struct ReadSink {
    source: SourceId,
    results: ChannelSink<(SourceId, Option<SourceReadResult>)>,
    token: CancellationToken,
    delivered: AtomicBool,
}

impl ReadSink {
    pub fn new(
        source: SourceId,
        results: ChannelSink<(SourceId, Option<SourceReadResult>)>,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            results,
            token,
            delivered: AtomicBool::new(false),
        }
    }

    /// Delivers one result for the sink's source. Returns `false` when the
    /// schedule is stopping and the adapter must stop emitting.
    pub async fn on_result(&self, result: SourceReadResult) -> bool {
        self.delivered.store(true, Ordering::Relaxed);
        self.results.submit((self.source.clone(), Some(result))).await;
        !self.token.is_cancelled()
    }

    /// Whether the schedule is stopping.
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the adapter delivered anything through this sink.
    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Marks the source done for this cycle without a value.
    pub async fn mark_done(&self) {
        self.results.submit((self.source.clone(), None)).await;
    }
}

/// One protocol-adapter-backed origin of channel values.
///
/// `read` is invoked once per cycle per configured source. An adapter that
/// returns without delivering anything is marked done for the cycle
/// without a value; an adapter returning an error is recorded as a failed
/// read for the cycle.
#[async_trait]
pub trait SourceValuesReader: Send + Sync {
    async fn read(&self, sink: &ReadSink) -> Result<(), SourceReadError>;
}

/// Resolved adapter factory supplied at wiring time, in place of any
/// dynamic plugin loading.
pub type SourceReaderFactory =
    Arc<dyn Fn(&SourceConfig) -> Result<Arc<dyn SourceValuesReader>, SourceReadError> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::OverflowPolicy;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sink(
        token: CancellationToken,
    ) -> (
        ReadSink,
        mpsc::Receiver<(SourceId, Option<SourceReadResult>)>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let results = ChannelSink::new(
            tx,
            "results",
            8,
            Duration::from_millis(100),
            OverflowPolicy::Block,
        );
        (ReadSink::new("press".to_string(), results, token), rx)
    }

    #[tokio::test]
    async fn on_result_posts_and_reports_running() {
        let token = CancellationToken::new();
        let (sink, mut rx) = sink(token.clone());

        let keep_reading = sink
            .on_result(SourceReadResult::values(HashMap::new()))
            .await;
        assert!(keep_reading);
        assert!(sink.delivered());

        let (source, result) = rx.recv().await.unwrap();
        assert_eq!(source, "press");
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn on_result_signals_stop_after_cancellation() {
        let token = CancellationToken::new();
        let (sink, _rx) = sink(token.clone());

        token.cancel();
        let keep_reading = sink
            .on_result(SourceReadResult::values(HashMap::new()))
            .await;
        assert!(!keep_reading);
        assert!(sink.is_stopping());
    }

    #[tokio::test]
    async fn mark_done_posts_nil() {
        let token = CancellationToken::new();
        let (sink, mut rx) = sink(token);

        sink.mark_done().await;
        assert!(!sink.delivered());

        let (source, result) = rx.recv().await.unwrap();
        assert_eq!(source, "press");
        assert!(result.is_none());
    }
}
