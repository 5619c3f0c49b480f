//! Per-stage artifact cache with single-flight population.
//!
//! For each key there is at most one in-flight computation. The first
//! caller for an absent key spawns it on a detached task; everyone else
//! (including callers that arrive while it runs) attaches to that task's
//! result. A caller that stops waiting does not cancel the computation, so a
//! billed call that already started still fills the entry for later callers.
//!
//! Successful values are kept until process exit. Failures are handed to
//! every attached waiter and then forgotten, so the next call starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use crate::schema::{CacheSource, FailureReason};

type Outcome<V> = Option<Result<Arc<V>, FailureReason>>;

enum Slot<V> {
    Ready(Arc<V>),
    Pending(watch::Receiver<Outcome<V>>),
}

pub struct SingleFlight<K, V> {
    name: &'static str,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once across
    /// all concurrent callers and cache its success.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: K,
        compute: F,
    ) -> Result<(Arc<V>, CacheSource), FailureReason>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, FailureReason>> + Send + 'static,
    {
        let (mut rx, source) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(&key) {
                Some(Slot::Ready(value)) => return Ok((Arc::clone(value), CacheSource::Hit)),
                Some(Slot::Pending(rx)) => (rx.clone(), CacheSource::Joined),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), Slot::Pending(rx.clone()));
                    self.spawn_flight(key, compute(), tx);
                    (rx, CacheSource::Computed)
                }
            }
        };

        if source == CacheSource::Joined {
            debug!(cache = self.name, "Joining in-flight computation");
        }

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|guard| guard.clone())
            .ok()
            .flatten();

        match outcome {
            Some(result) => result.map(|value| (value, source)),
            None => Err(FailureReason::Internal {
                detail: format!("{}: in-flight computation vanished", self.name),
            }),
        }
    }

    fn spawn_flight<Fut>(&self, key: K, fut: Fut, tx: watch::Sender<Outcome<V>>)
    where
        Fut: Future<Output = Result<V, FailureReason>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let name = self.name;
        tokio::spawn(async move {
            // The inner task isolates panics in `fut` so the slot is always settled.
            let result = match tokio::spawn(fut).await {
                Ok(result) => result.map(Arc::new),
                Err(join_err) => Err(FailureReason::Internal {
                    detail: format!("{name}: computation panicked: {join_err}"),
                }),
            };

            {
                let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                match &result {
                    Ok(value) => {
                        slots.insert(key, Slot::Ready(Arc::clone(value)));
                    }
                    Err(_) => {
                        slots.remove(&key);
                    }
                }
            }

            tx.send_replace(Some(result));
        });
    }

    /// Cached value without triggering computation.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(key) {
            Some(Slot::Ready(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Number of settled entries.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_lookup_is_a_hit() {
        let cache: SingleFlight<String, String> = SingleFlight::new("test");
        let (v, src) = cache
            .get_or_compute("k".into(), || async { Ok("value".to_string()) })
            .await
            .unwrap();
        assert_eq!(*v, "value");
        assert_eq!(src, CacheSource::Computed);

        let (v, src) = cache
            .get_or_compute("k".into(), || async { Ok("other".to_string()) })
            .await
            .unwrap();
        assert_eq!(*v, "value");
        assert_eq!(src, CacheSource::Hit);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(7, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            let (value, _) = handle.await.unwrap().unwrap();
            assert_eq!(*value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: SingleFlight<u32, u32> = SingleFlight::new("test");
        let err = cache
            .get_or_compute(1, || async {
                Err(FailureReason::Rejected {
                    detail: "nope".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FailureReason::Rejected { .. }));
        assert!(cache.is_empty());

        let (value, src) = cache.get_or_compute(1, || async { Ok(5) }).await.unwrap();
        assert_eq!(*value, 5);
        assert_eq!(src, CacheSource::Computed);
    }

    #[tokio::test]
    async fn test_cancelled_caller_still_populates_entry() {
        let cache: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(3, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(9)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.peek(&3).as_deref(), Some(&9));

        let (value, src) = cache.get_or_compute(3, || async { Ok(0) }).await.unwrap();
        assert_eq!(*value, 9);
        assert_eq!(src, CacheSource::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_computation_settles_slot() {
        let cache: SingleFlight<u32, u32> = SingleFlight::new("test");
        let err = cache
            .get_or_compute(1, || async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FailureReason::Internal { .. }));

        let (value, _) = cache.get_or_compute(1, || async { Ok(1) }).await.unwrap();
        assert_eq!(*value, 1);
    }
}
