//! Keyed single-flight cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{CacheError, Slot};

type Supplier<K, T> = Arc<dyn Fn(&K) -> T + Send + Sync>;
type Initializer<K, T, I> =
    Arc<dyn Fn(K, T, Option<I>) -> BoxFuture<'static, Result<T, CacheError>> + Send + Sync>;
type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type ErrorHook<K, T> = Arc<dyn Fn(&K, CacheError) -> Result<T, CacheError> + Send + Sync>;

/// Concurrency-safe memoizing cache with at-most-one-initializer-per-key
/// semantics.
///
/// On the first `get` for a key the supplier produces a raw value, the
/// initializer (if any) combines it with the caller-supplied init data, and
/// the outcome is stored; every concurrent caller for the same key awaits
/// the same in-flight slot instead of re-running the supplier. On hits the
/// validity predicate decides whether the cached value is still usable; if
/// not the entry is replaced by a fresh single-flight initialization.
///
/// The error hook can turn an initialization failure into a substitute
/// value, which is cached like a regular value. A propagated error is
/// returned to every caller waiting on the attempt but is not cached: the
/// next `get` re-initializes.
pub struct LookupCache<K, T, I> {
    entries: Arc<Mutex<HashMap<K, Arc<Slot<T>>>>>,
    supplier: Supplier<K, T>,
    initializer: Option<Initializer<K, T, I>>,
    is_valid: Option<Validator<T>>,
    on_init_error: Option<ErrorHook<K, T>>,
}

impl<K, T, I> Clone for LookupCache<K, T, I> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            supplier: self.supplier.clone(),
            initializer: self.initializer.clone(),
            is_valid: self.is_valid.clone(),
            on_init_error: self.on_init_error.clone(),
        }
    }
}

impl<K, T, I> LookupCache<K, T, I>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    I: Send + 'static,
{
    pub fn new(supplier: impl Fn(&K) -> T + Send + Sync + 'static) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            supplier: Arc::new(supplier),
            initializer: None,
            is_valid: None,
            on_init_error: None,
        }
    }

    /// Asynchronous initialization applied to the supplier's raw value and
    /// the caller's init data.
    pub fn with_initializer<F, Fut>(mut self, initializer: F) -> Self
    where
        F: Fn(K, T, Option<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        self.initializer = Some(Arc::new(move |key, raw, init| {
            initializer(key, raw, init).boxed()
        }));
        self
    }

    /// Predicate consulted on hits; a value failing it is discarded and
    /// re-initialized.
    pub fn with_validator(mut self, is_valid: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.is_valid = Some(Arc::new(is_valid));
        self
    }

    /// Called when initialization fails; may supply a substitute value
    /// (cached) or return an error (not cached).
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(&K, CacheError) -> Result<T, CacheError> + Send + Sync + 'static,
    ) -> Self {
        self.on_init_error = Some(Arc::new(hook));
        self
    }

    /// Looks up the value for `key`, initializing it single-flight when
    /// absent or no longer valid.
    pub async fn get(&self, key: &K, init: Option<I>) -> Result<Arc<T>, CacheError> {
        let (slot, starts_initialization) = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(existing) => match existing.peek() {
                    Some(Ok(value)) if self.still_valid(value) => return Ok(value.clone()),
                    Some(_) => {
                        // Completed but invalid; replace with a fresh slot.
                        let fresh = Arc::new(Slot::new());
                        entries.insert(key.clone(), fresh.clone());
                        (fresh, true)
                    }
                    None => (existing.clone(), false),
                },
                None => {
                    let fresh = Arc::new(Slot::new());
                    entries.insert(key.clone(), fresh.clone());
                    (fresh, true)
                }
            }
        };

        if starts_initialization {
            self.spawn_initialization(key.clone(), init, slot.clone());
        }

        slot.wait().await
    }

    fn still_valid(&self, value: &Arc<T>) -> bool {
        self.is_valid.as_ref().is_none_or(|valid| valid(value))
    }

    // The initialization runs in its own task so that a caller cancelled
    // mid-flight (a timed-out read cycle) cannot strand other waiters on a
    // slot that never completes.
    fn spawn_initialization(&self, key: K, init: Option<I>, slot: Arc<Slot<T>>) {
        let entries = self.entries.clone();
        let supplier = self.supplier.clone();
        let initializer = self.initializer.clone();
        let on_init_error = self.on_init_error.clone();

        tokio::spawn(async move {
            let raw = supplier(&key);
            let initialized = match &initializer {
                Some(initializer) => initializer(key.clone(), raw, init).await,
                None => Ok(raw),
            };

            let result = match initialized {
                Ok(value) => Ok(Arc::new(value)),
                Err(e) => match &on_init_error {
                    Some(hook) => hook(&key, e).map(Arc::new),
                    None => Err(e),
                },
            };

            if result.is_err() {
                // Errors are not cached: drop the entry (unless another
                // initialization already replaced it) so the next call
                // retries.
                let mut entries = entries.lock();
                if let Some(current) = entries.get(&key)
                    && Arc::ptr_eq(current, &slot)
                {
                    entries.remove(&key);
                }
            }

            slot.complete(result);
        });
    }

    /// Removes one entry; an in-flight initialization still completes for
    /// its current waiters.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_supplier() -> (Arc<AtomicUsize>, impl Fn(&String) -> usize + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        (count, move |_key: &String| {
            counted.fetch_add(1, Ordering::SeqCst)
        })
    }

    #[tokio::test]
    async fn concurrent_gets_run_the_supplier_once() {
        let (count, supplier) = counting_supplier();
        let cache: Arc<LookupCache<String, usize, ()>> = Arc::new(
            LookupCache::new(supplier).with_initializer(|_key, raw, _init| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(raw)
            }),
        );

        let key = "plc-1".to_string();
        let gets = (0..8).map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.get(&key, None).await })
        });

        let values: Vec<Arc<usize>> = futures::future::join_all(gets)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| **v == 0));
    }

    #[tokio::test]
    async fn distinct_keys_initialize_independently() {
        let (count, supplier) = counting_supplier();
        let cache: LookupCache<String, usize, ()> = LookupCache::new(supplier);

        let a = cache.get(&"a".to_string(), None).await.unwrap();
        let b = cache.get(&"b".to_string(), None).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_ne!(*a, *b);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn invalid_value_is_reinitialized() {
        let (count, supplier) = counting_supplier();
        let cache: LookupCache<String, usize, ()> =
            LookupCache::new(supplier).with_validator(|value| *value != 0);

        let key = "conn".to_string();
        let first = cache.get(&key, None).await.unwrap();
        assert_eq!(*first, 0);

        // The hit sees 0, rejects it and re-runs the supplier.
        let second = cache.get(&key, None).await.unwrap();
        assert_eq!(*second, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_hook_substitute_is_cached() {
        let (count, supplier) = counting_supplier();
        let cache: LookupCache<String, usize, ()> = LookupCache::new(supplier)
            .with_initializer(|_key, _raw, _init| async move {
                Err(CacheError::initialization("device offline"))
            })
            .with_error_hook(|_key, _e| Ok(99));

        let key = "conn".to_string();
        assert_eq!(*cache.get(&key, None).await.unwrap(), 99);
        assert_eq!(*cache.get(&key, None).await.unwrap(), 99);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn propagated_error_is_not_cached() {
        let (count, supplier) = counting_supplier();
        let attempts = count.clone();
        let cache: LookupCache<String, usize, ()> =
            LookupCache::new(supplier).with_initializer(move |_key, raw, _init| {
                let fail = attempts.load(Ordering::SeqCst) == 1;
                async move {
                    if fail {
                        Err(CacheError::initialization("transient"))
                    } else {
                        Ok(raw)
                    }
                }
            });

        let key = "conn".to_string();
        assert!(cache.get(&key, None).await.is_err());
        assert!(cache.is_empty());

        // Next call retries and succeeds.
        assert_eq!(*cache.get(&key, None).await.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reinitialization() {
        let (count, supplier) = counting_supplier();
        let cache: LookupCache<String, usize, ()> = LookupCache::new(supplier);

        let key = "conn".to_string();
        cache.get(&key, None).await.unwrap();
        cache.invalidate(&key);
        cache.get(&key, None).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn init_data_reaches_the_initializer() {
        let cache: LookupCache<String, String, u32> = LookupCache::new(|key: &String| key.clone())
            .with_initializer(|_key, raw, init| async move {
                Ok(format!("{raw}:{}", init.unwrap_or(0)))
            });

        let value = cache.get(&"conn".to_string(), Some(7)).await.unwrap();
        assert_eq!(*value, "conn:7");
    }
}
