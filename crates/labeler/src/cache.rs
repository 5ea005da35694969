//! Time-bounded cache with singleflight fetch deduplication.
//!
//! Keyed read-through cache for repository metadata (label lists,
//! recent-issue lists) and installation IDs. Concurrent callers for the
//! same key share one in-flight fetch; its result, success or failure,
//! is delivered to every waiter. Instances are plain values handed to
//! the services that need them, so tests can construct isolated caches.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

/// Error surfaced by [`TtlCache::get_or_fetch`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The underlying fetch failed; shared with every waiter.
    #[error("fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    /// The task running the fetch was cancelled before completing.
    #[error("fetch aborted before completion")]
    Aborted,
}

type Shared<V> = Result<V, CacheError>;

enum EntryState<V> {
    /// Value cached at the given instant.
    Ready { value: V, inserted: Instant },
    /// A fetch is in flight; waiters subscribe to the channel.
    Pending(watch::Receiver<Option<Shared<V>>>),
}

struct Entry<V> {
    state: EntryState<V>,
    last_used: Instant,
}

/// TTL cache bounded to a fixed number of entries.
pub struct TtlCache<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Return the cached value for `key` if it is younger than `ttl`,
    /// otherwise run `fetch` and cache its result. At most one fetch per
    /// key is in flight at a time; concurrent callers await that fetch's
    /// result. Errors are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> Shared<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        // The await on a pending fetch must happen outside this block so
        // the mutex guard is not considered live across an await point.
        let tx = {
            let mut map = self.inner.lock().expect("cache lock poisoned");
            match map.get_mut(&key) {
                Some(entry) => match &entry.state {
                    EntryState::Ready { value, inserted } if inserted.elapsed() < ttl => {
                        entry.last_used = Instant::now();
                        return Ok(value.clone());
                    }
                    EntryState::Pending(rx) => Err(rx.clone()),
                    EntryState::Ready { .. } => {
                        // Stale; this caller becomes the fetcher.
                        let (tx, rx) = watch::channel(None);
                        entry.state = EntryState::Pending(rx);
                        entry.last_used = Instant::now();
                        Ok(tx)
                    }
                },
                None => {
                    let (tx, rx) = watch::channel(None);
                    self.evict_if_full(&mut map);
                    map.insert(
                        key.clone(),
                        Entry {
                            state: EntryState::Pending(rx),
                            last_used: Instant::now(),
                        },
                    );
                    Ok(tx)
                }
            }
        };
        let tx = match tx {
            Ok(tx) => tx,
            Err(rx) => return Self::await_pending(rx).await,
        };

        // The lock is released while the fetch runs. If this future is
        // dropped mid-fetch the guard removes the pending entry so later
        // callers start a fresh fetch instead of waiting forever.
        let guard = PendingGuard {
            cache: self,
            key: key.clone(),
            armed: true,
        };
        let result = fetch().await;
        Self::complete(guard, &tx, result)
    }

    fn complete(
        mut guard: PendingGuard<'_, K, V>,
        tx: &watch::Sender<Option<Shared<V>>>,
        result: anyhow::Result<V>,
    ) -> Shared<V> {
        guard.armed = false;
        let mut map = guard.cache.inner.lock().expect("cache lock poisoned");
        let shared = match result {
            Ok(value) => {
                map.insert(
                    guard.key.clone(),
                    Entry {
                        state: EntryState::Ready {
                            value: value.clone(),
                            inserted: Instant::now(),
                        },
                        last_used: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(err) => {
                map.remove(&guard.key);
                Err(CacheError::Fetch(Arc::new(err)))
            }
        };
        drop(map);
        let _ = tx.send(Some(shared.clone()));
        shared
    }

    async fn await_pending(mut rx: watch::Receiver<Option<Shared<V>>>) -> Shared<V> {
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::Aborted);
            }
        }
    }

    /// Evict the least-recently-used ready entry when at capacity.
    /// In-flight fetches are never evicted: removing a pending entry
    /// would let a second fetch start for the same key, breaking the
    /// one-fetch-per-key guarantee. The capacity bound is therefore
    /// soft while fetches are in flight (at most `capacity` ready
    /// entries plus however many fetches are concurrently pending) and
    /// tightens back as fetches complete.
    fn evict_if_full(&self, map: &mut HashMap<K, Entry<V>>) {
        if map.len() < self.capacity {
            return;
        }
        let victim = map
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Ready { .. }))
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            map.remove(&k);
        }
    }

    fn remove_pending(&self, key: &K) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = map.get(key) {
            if matches!(entry.state, EntryState::Pending(_)) {
                map.remove(key);
            }
        }
    }

    /// Number of entries currently held (ready or pending).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a TtlCache<K, V>,
    key: K,
    armed: bool,
}

impl<K, V> Drop for PendingGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.armed {
            self.cache.remove_pending(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(TtlCache::<String, u64>::new(16));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("o/r".to_string(), Duration::from_secs(60), || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let cache = TtlCache::<&str, u64>::new(16);
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let got = cache
                .get_or_fetch("k", Duration::from_millis(10), || async {
                    Ok(fetches.fetch_add(1, Ordering::SeqCst) as u64)
                })
                .await
                .unwrap();
            let _ = got;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_error_propagates_to_waiters_and_is_not_cached() {
        let cache = Arc::new(TtlCache::<&str, u64>::new(16));

        let c1 = Arc::clone(&cache);
        let first = tokio::spawn(async move {
            c1.get_or_fetch("k", Duration::from_secs(60), || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(anyhow::anyhow!("upstream down"))
            })
            .await
        });
        // Let the first caller become the fetcher.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let c2 = Arc::clone(&cache);
        let second = tokio::spawn(async move {
            c2.get_or_fetch("k", Duration::from_secs(60), || async { Ok(1) })
                .await
        });

        assert!(first.await.unwrap().is_err());
        // The waiter sees the shared error, not a fresh fetch.
        assert!(second.await.unwrap().is_err());
        // Nothing was cached; a later call fetches again and succeeds.
        let got = cache
            .get_or_fetch("k", Duration::from_secs(60), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pending_fetches_overshoot_capacity_then_recover() {
        let cache = Arc::new(TtlCache::<u32, u32>::new(1));

        // Two slow fetches for distinct keys run concurrently; neither
        // may be evicted to make room for the other.
        let mut handles = Vec::new();
        for k in 0..2 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(k, Duration::from_secs(60), || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(k)
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.len(), 2, "in-flight fetches are not evicted");

        for (k, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), k as u32);
        }

        // Once everything is ready, inserts evict instead of growing
        // the map further.
        cache
            .get_or_fetch(9, Duration::from_secs(60), || async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let cache = TtlCache::<u32, u32>::new(2);
        for k in 0..2 {
            cache
                .get_or_fetch(k, Duration::from_secs(60), || async move { Ok(k) })
                .await
                .unwrap();
        }
        // Touch key 0 so key 1 is the eviction victim.
        cache
            .get_or_fetch(0, Duration::from_secs(60), || async { Ok(0) })
            .await
            .unwrap();
        cache
            .get_or_fetch(2, Duration::from_secs(60), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        let fetched = AtomicUsize::new(0);
        cache
            .get_or_fetch(0, Duration::from_secs(60), || async {
                fetched.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
            .await
            .unwrap();
        assert_eq!(fetched.load(Ordering::SeqCst), 0, "key 0 should still be cached");
    }
}
