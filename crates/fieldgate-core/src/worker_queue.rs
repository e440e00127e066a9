//! Single-shot worker pool for one batch of uniform tasks.
//!
//! A [`WorkerQueue`] runs one task type across a fixed number of persistent
//! worker tasks. The caller submits inputs, then drains exactly as many
//! results as it submitted within a timeout. Awaiting consumes the queue
//! and cancels its workers; a new batch needs a new queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Error reported by a worker task. Logged by the worker; the task's result
/// slot becomes `None`.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum WorkerQueueError {
    #[error("received {received} of {expected} worker results within {timeout:?}")]
    Timeout {
        expected: u64,
        received: u64,
        timeout: Duration,
    },
}

/// Bounded pool of persistent workers consuming one task type.
///
/// Results carry no correlation to their inputs; [`WorkerQueue::await_results`]
/// drains by count in completion order.
pub struct WorkerQueue<T, R> {
    queue_tx: mpsc::Sender<T>,
    done_rx: mpsc::Receiver<Option<R>>,
    jobs: u64,
    workers: JoinSet<()>,
}

impl<T, R> WorkerQueue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Builds the pool and starts its workers. A task returning an error
    /// keeps its worker alive and yields a `None` result.
    pub fn new<F, Fut>(workers: usize, capacity: usize, task: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<T>(capacity);
        let (done_tx, done_rx) = mpsc::channel::<Option<R>>(capacity);

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let task = Arc::new(task);

        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let queue_rx = queue_rx.clone();
            let done_tx = done_tx.clone();
            let task = task.clone();

            set.spawn(async move {
                loop {
                    // Hold the receiver lock only while waiting for an input,
                    // so other workers can pick up tasks while this one runs.
                    let input = { queue_rx.lock().await.recv().await };
                    let Some(input) = input else {
                        break;
                    };

                    let result = match task(input).await {
                        Ok(result) => Some(result),
                        Err(e) => {
                            warn!(worker, error = %e, "worker task failed");
                            None
                        }
                    };

                    if done_tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            queue_tx,
            done_rx,
            jobs: 0,
            workers: set,
        }
    }

    /// Enqueues one task input.
    pub async fn submit(&mut self, input: T) {
        if self.queue_tx.send(input).await.is_ok() {
            self.jobs += 1;
        }
    }

    /// Number of inputs submitted since construction.
    pub fn submitted(&self) -> u64 {
        self.jobs
    }

    /// Drains exactly as many results as were submitted, or fails when the
    /// timeout elapses first. Consumes the queue; its workers are cancelled
    /// either way.
    pub async fn await_results(mut self, timeout: Duration) -> Result<Vec<Option<R>>, WorkerQueueError> {
        // No further submissions; workers exit once the queue drains.
        drop(self.queue_tx);

        let mut results = Vec::with_capacity(self.jobs as usize);
        let deadline = tokio::time::Instant::now() + timeout;

        while (results.len() as u64) < self.jobs {
            match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {
                    // A worker died without reporting (task panic). Account
                    // for the missing results so the count contract holds.
                    error!(
                        expected = self.jobs,
                        received = results.len(),
                        "worker results channel closed early"
                    );
                    while (results.len() as u64) < self.jobs {
                        results.push(None);
                    }
                }
                Err(_) => {
                    self.workers.abort_all();
                    return Err(WorkerQueueError::Timeout {
                        expected: self.jobs,
                        received: results.len() as u64,
                        timeout,
                    });
                }
            }
        }

        self.workers.abort_all();
        Ok(results)
    }
}
