//! Single-flight memoizing caches.
//!
//! [`ItemCache`] memoizes one expensive value, [`LookupCache`] one value
//! per key. Both guarantee that concurrent callers for the same
//! uninitialized entry trigger exactly one initialization and then observe
//! the same resulting value, and both support revalidation: a validity
//! predicate (and a TTL for `ItemCache`) decides on each hit whether the
//! cached value is still usable, and an invalid entry is discarded and
//! re-initialized — again single-flight.
//!
//! The map lock is held only while deciding whether to start an
//! initializer, never while one runs, so lookups for other keys never
//! block on an in-flight initialization.

mod item;
mod lookup;

use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Notify;

pub use item::ItemCache;
pub use lookup::LookupCache;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache initialization failed: {0}")]
    Initialization(String),
}

impl CacheError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }
}

/// One cached entry: the eventual value plus a wakeup for callers that
/// arrive while initialization is in flight.
pub(crate) struct Slot<T> {
    completed_at: OnceLock<Instant>,
    result: OnceLock<Result<std::sync::Arc<T>, CacheError>>,
    notify: Notify,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            completed_at: OnceLock::new(),
            result: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    pub(crate) fn complete(&self, result: Result<std::sync::Arc<T>, CacheError>) {
        let _ = self.completed_at.set(Instant::now());
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    /// Completed result, if initialization has finished.
    pub(crate) fn peek(&self) -> Option<&Result<std::sync::Arc<T>, CacheError>> {
        self.result.get()
    }

    pub(crate) fn completed_at(&self) -> Option<Instant> {
        self.completed_at.get().copied()
    }

    pub(crate) async fn wait(&self) -> Result<std::sync::Arc<T>, CacheError> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            // Register for a wakeup, then re-check to close the gap between
            // the check and the registration.
            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}
