//! Bounded-channel submission with policy-driven overflow handling.
//!
//! Every inter-stage handoff in the pipeline goes through a
//! [`ChannelSink`]: a non-blocking send first, and when the channel is
//! full either an immediate drop or a blocking send bounded by a timeout,
//! selected by the configured [`OverflowPolicy`]. Submission problems are
//! logged with a hint naming the tuning parameter to raise; they are never
//! surfaced to the submitting stage as errors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What a full channel does to a submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Block for at most the submit timeout, then drop with an error log.
    #[default]
    Block,
    /// Drop the element immediately with a warning.
    Drop,
}

/// Observable outcome of one submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitEvent {
    /// Element went through without blocking.
    Submitted,
    /// Channel was full, submit is about to block.
    Blocking,
    /// Blocking submit went through after waiting.
    SubmittedBlocking { waited: Duration },
    /// Blocking submit did not complete within the timeout; element dropped.
    TimedOut,
    /// Channel was full and the policy dropped the element.
    Dropped,
    /// Receiver is gone; element dropped.
    Closed,
}

type EventHook = Arc<dyn Fn(SubmitEvent) + Send + Sync>;

/// A named, bounded channel endpoint with overflow policy and tuning hints.
pub struct ChannelSink<T> {
    tx: mpsc::Sender<T>,
    name: &'static str,
    capacity: usize,
    timeout: Duration,
    policy: OverflowPolicy,
    /// Tuning parameter names quoted in blocking/timeout log hints.
    size_parameter: &'static str,
    timeout_parameter: &'static str,
    on_event: Option<EventHook>,
}

impl<T> Clone for ChannelSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name,
            capacity: self.capacity,
            timeout: self.timeout,
            policy: self.policy,
            size_parameter: self.size_parameter,
            timeout_parameter: self.timeout_parameter,
            on_event: self.on_event.clone(),
        }
    }
}

impl<T: Send> ChannelSink<T> {
    pub fn new(
        tx: mpsc::Sender<T>,
        name: &'static str,
        capacity: usize,
        timeout: Duration,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            tx,
            name,
            capacity,
            timeout,
            policy,
            size_parameter: "channel size",
            timeout_parameter: "channel timeout",
            on_event: None,
        }
    }

    /// Names the tuning parameters quoted in log hints for this channel.
    pub fn with_tuning_hints(
        mut self,
        size_parameter: &'static str,
        timeout_parameter: &'static str,
    ) -> Self {
        self.size_parameter = size_parameter;
        self.timeout_parameter = timeout_parameter;
        self
    }

    /// Injects an observer for submit events.
    pub fn with_event_hook(mut self, hook: impl Fn(SubmitEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(hook));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: SubmitEvent) {
        if let Some(hook) = &self.on_event {
            hook(event);
        }
    }

    /// Submits one element, applying the overflow policy when the channel is
    /// full. Returns whether the element was delivered; failures are logged,
    /// never propagated.
    pub async fn submit(&self, element: T) -> bool {
        let element = match self.tx.try_send(element) {
            Ok(()) => {
                self.emit(SubmitEvent::Submitted);
                return true;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(channel = self.name, "channel closed, element dropped");
                self.emit(SubmitEvent::Closed);
                return false;
            }
            Err(TrySendError::Full(element)) => element,
        };

        match self.policy {
            OverflowPolicy::Drop => {
                warn!(
                    channel = self.name,
                    capacity = self.capacity,
                    "channel full, dropping element, consider setting {} to a higher value",
                    self.size_parameter
                );
                self.emit(SubmitEvent::Dropped);
                false
            }
            OverflowPolicy::Block => {
                warn!(
                    channel = self.name,
                    capacity = self.capacity,
                    "sending to channel is blocking, consider setting {} to a higher value",
                    self.size_parameter
                );
                self.emit(SubmitEvent::Blocking);

                let started = Instant::now();
                match tokio::time::timeout(self.timeout, self.tx.send(element)).await {
                    Ok(Ok(())) => {
                        let waited = started.elapsed();
                        warn!(
                            channel = self.name,
                            waited_ms = waited.as_millis() as u64,
                            "blocking send completed, consider setting {} to a higher value",
                            self.size_parameter
                        );
                        self.emit(SubmitEvent::SubmittedBlocking { waited });
                        true
                    }
                    Ok(Err(_)) => {
                        debug!(channel = self.name, "channel closed, element dropped");
                        self.emit(SubmitEvent::Closed);
                        false
                    }
                    Err(_) => {
                        error!(
                            channel = self.name,
                            timeout_ms = self.timeout.as_millis() as u64,
                            "timeout sending to channel, consider setting {} to a longer value",
                            self.timeout_parameter
                        );
                        self.emit(SubmitEvent::TimedOut);
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn sink_with_events<T: Send>(
        tx: mpsc::Sender<T>,
        policy: OverflowPolicy,
        timeout: Duration,
    ) -> (ChannelSink<T>, Arc<Mutex<Vec<SubmitEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink = ChannelSink::new(tx, "test", 1, timeout, policy)
            .with_event_hook(move |e| recorded.lock().push(e));
        (sink, events)
    }

    #[tokio::test]
    async fn submit_without_contention() {
        let (tx, mut rx) = mpsc::channel(1);
        let (sink, events) = sink_with_events(tx, OverflowPolicy::Block, Duration::from_millis(50));

        assert!(sink.submit(1u32).await);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(events.lock().as_slice(), &[SubmitEvent::Submitted]);
    }

    #[tokio::test]
    async fn drop_policy_discards_on_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let (sink, events) = sink_with_events(tx, OverflowPolicy::Drop, Duration::from_millis(50));

        assert!(sink.submit(1u32).await);
        assert!(!sink.submit(2u32).await);
        assert_eq!(events.lock().as_slice(), &[SubmitEvent::Submitted, SubmitEvent::Dropped]);
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn block_policy_waits_for_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let (sink, events) = sink_with_events(tx, OverflowPolicy::Block, Duration::from_millis(500));

        assert!(sink.submit(1u32).await);

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });

        assert!(sink.submit(2u32).await);
        let (first, second) = consumer.await.unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));

        let events = events.lock();
        assert_eq!(events[0], SubmitEvent::Submitted);
        assert_eq!(events[1], SubmitEvent::Blocking);
        assert!(matches!(events[2], SubmitEvent::SubmittedBlocking { .. }));
    }

    #[tokio::test]
    async fn block_policy_times_out_without_consumer() {
        let (tx, _rx) = mpsc::channel(1);
        let (sink, events) = sink_with_events(tx, OverflowPolicy::Block, Duration::from_millis(30));

        assert!(sink.submit(1u32).await);
        assert!(!sink.submit(2u32).await);
        assert_eq!(events.lock().last(), Some(&SubmitEvent::TimedOut));
    }

    #[tokio::test]
    async fn closed_channel_is_not_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (sink, events) = sink_with_events(tx, OverflowPolicy::Block, Duration::from_millis(30));

        assert!(!sink.submit(1u32).await);
        assert_eq!(events.lock().as_slice(), &[SubmitEvent::Closed]);
    }
}
