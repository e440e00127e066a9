//! Singleton single-flight cache.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{CacheError, Slot};

type Supplier<T> = Arc<dyn Fn() -> T + Send + Sync>;
type Initializer<T, I> =
    Arc<dyn Fn(T, Option<I>) -> BoxFuture<'static, Result<T, CacheError>> + Send + Sync>;
type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type ErrorHook<T> = Arc<dyn Fn(CacheError) -> Result<T, CacheError> + Send + Sync>;

/// Memoizes one expensive value with single-flight initialization and
/// optional TTL/validity revalidation.
///
/// The keyless counterpart of [`super::LookupCache`], for resources a
/// component holds exactly one of (a device session, a signed token). A
/// value older than the configured TTL, or rejected by the validity
/// predicate, is discarded and re-initialized; concurrent callers during
/// initialization await the same slot.
pub struct ItemCache<T, I> {
    entry: Arc<Mutex<Option<Arc<Slot<T>>>>>,
    supplier: Supplier<T>,
    initializer: Option<Initializer<T, I>>,
    valid_for: Option<Duration>,
    is_valid: Option<Validator<T>>,
    on_init_error: Option<ErrorHook<T>>,
}

impl<T, I> Clone for ItemCache<T, I> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            supplier: self.supplier.clone(),
            initializer: self.initializer.clone(),
            valid_for: self.valid_for,
            is_valid: self.is_valid.clone(),
            on_init_error: self.on_init_error.clone(),
        }
    }
}

impl<T, I> ItemCache<T, I>
where
    T: Send + Sync + 'static,
    I: Send + 'static,
{
    pub fn new(supplier: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            entry: Arc::new(Mutex::new(None)),
            supplier: Arc::new(supplier),
            initializer: None,
            valid_for: None,
            is_valid: None,
            on_init_error: None,
        }
    }

    pub fn with_initializer<F, Fut>(mut self, initializer: F) -> Self
    where
        F: Fn(T, Option<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        self.initializer = Some(Arc::new(move |raw, init| initializer(raw, init).boxed()));
        self
    }

    /// Values older than this are re-initialized on the next `get`.
    pub fn with_ttl(mut self, valid_for: Duration) -> Self {
        self.valid_for = Some(valid_for);
        self
    }

    pub fn with_validator(mut self, is_valid: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.is_valid = Some(Arc::new(is_valid));
        self
    }

    /// Called when initialization fails; may supply a substitute value
    /// (cached) or return an error (not cached).
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(CacheError) -> Result<T, CacheError> + Send + Sync + 'static,
    ) -> Self {
        self.on_init_error = Some(Arc::new(hook));
        self
    }

    /// Returns the cached value, initializing it single-flight when absent,
    /// expired or invalid.
    pub async fn get(&self, init: Option<I>) -> Result<Arc<T>, CacheError> {
        let (slot, starts_initialization) = {
            let mut entry = self.entry.lock();
            match entry.as_ref() {
                Some(existing) => match existing.peek() {
                    Some(Ok(value)) if !self.expired(existing) && self.still_valid(value) => {
                        return Ok(value.clone());
                    }
                    Some(_) => {
                        let fresh = Arc::new(Slot::new());
                        *entry = Some(fresh.clone());
                        (fresh, true)
                    }
                    None => (existing.clone(), false),
                },
                None => {
                    let fresh = Arc::new(Slot::new());
                    *entry = Some(fresh.clone());
                    (fresh, true)
                }
            }
        };

        if starts_initialization {
            self.spawn_initialization(init, slot.clone());
        }

        slot.wait().await
    }

    fn expired(&self, slot: &Arc<Slot<T>>) -> bool {
        match (self.valid_for, slot.completed_at()) {
            (Some(ttl), Some(completed_at)) => completed_at.elapsed() >= ttl,
            _ => false,
        }
    }

    fn still_valid(&self, value: &Arc<T>) -> bool {
        self.is_valid.as_ref().is_none_or(|valid| valid(value))
    }

    // Run in its own task so a cancelled caller cannot strand concurrent
    // waiters on a slot that never completes.
    fn spawn_initialization(&self, init: Option<I>, slot: Arc<Slot<T>>) {
        let entry = self.entry.clone();
        let supplier = self.supplier.clone();
        let initializer = self.initializer.clone();
        let on_init_error = self.on_init_error.clone();

        tokio::spawn(async move {
            let raw = supplier();
            let initialized = match &initializer {
                Some(initializer) => initializer(raw, init).await,
                None => Ok(raw),
            };

            let result = match initialized {
                Ok(value) => Ok(Arc::new(value)),
                Err(e) => match &on_init_error {
                    Some(hook) => hook(e).map(Arc::new),
                    None => Err(e),
                },
            };

            if result.is_err() {
                let mut entry = entry.lock();
                if let Some(current) = entry.as_ref()
                    && Arc::ptr_eq(current, &slot)
                {
                    *entry = None;
                }
            }

            slot.complete(result);
        });
    }

    /// Discards the cached value; an in-flight initialization still
    /// completes for its current waiters.
    pub fn clear(&self) {
        *self.entry.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_supplier() -> (Arc<AtomicUsize>, impl Fn() -> usize + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        (count, move || counted.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn concurrent_gets_initialize_once() {
        let (count, supplier) = counting_supplier();
        let cache: Arc<ItemCache<usize, ()>> = Arc::new(ItemCache::new(supplier).with_initializer(
            |raw, _init| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(raw)
            },
        ));

        let gets = (0..8).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(None).await })
        });

        for joined in futures::future::join_all(gets).await {
            assert_eq!(*joined.unwrap().unwrap(), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_value_is_reinitialized() {
        let (count, supplier) = counting_supplier();
        let cache: ItemCache<usize, ()> =
            ItemCache::new(supplier).with_ttl(Duration::from_millis(30));

        assert_eq!(*cache.get(None).await.unwrap(), 0);
        assert_eq!(*cache.get(None).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*cache.get(None).await.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_forces_reinitialization() {
        let (count, supplier) = counting_supplier();
        let cache: ItemCache<usize, ()> = ItemCache::new(supplier);

        cache.get(None).await.unwrap();
        cache.clear();
        cache.get(None).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_hook_substitute_is_cached() {
        let (count, supplier) = counting_supplier();
        let cache: ItemCache<usize, ()> = ItemCache::new(supplier)
            .with_initializer(|_raw, _init| async move {
                Err(CacheError::initialization("handshake failed"))
            })
            .with_error_hook(|_e| Ok(42));

        assert_eq!(*cache.get(None).await.unwrap(), 42);
        assert_eq!(*cache.get(None).await.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_data_reaches_the_initializer() {
        let cache: ItemCache<String, &'static str> = ItemCache::new(|| "session".to_string())
            .with_initializer(|raw, init| async move {
                Ok(format!("{raw}@{}", init.unwrap_or("default")))
            });

        assert_eq!(*cache.get(Some("plc-7")).await.unwrap(), "session@plc-7");
    }
}
