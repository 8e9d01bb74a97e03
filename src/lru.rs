//! Bounded async map with LRU eviction.
//!
//! [`AsyncLru`] caches values with asynchronous construction and
//! destruction. Lookups share one construction future per key, eviction
//! destroys the least-recently-used entry in the background, and a
//! re-construction of a key never begins before the previous destruction of
//! that key has finished. The media layer relies on that ordering: a media
//! descriptor's destructor removes the scratch directory its successor will
//! recreate.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::Error;

/// Errors are shared between every waiter of a construction.
pub type SharedError = Arc<Error>;

type ConstructFuture<V> = Shared<BoxFuture<'static, Result<Arc<V>, SharedError>>>;
type DestructFuture = Shared<BoxFuture<'static, ()>>;
type Constructor<K, V> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<Arc<V>, SharedError>> + Send + Sync>;
type Destructor<K, V> = Arc<dyn Fn(K, Arc<V>) -> BoxFuture<'static, ()> + Send + Sync>;

struct LruState<K, V> {
    /// LRU order; most recently used at the tail.
    order: Vec<K>,
    cache: HashMap<K, ConstructFuture<V>>,
    destructions: HashMap<K, DestructFuture>,
}

/// Bounded key/value map with async construction and destruction.
pub struct AsyncLru<K, V> {
    capacity: usize,
    construct: Constructor<K, V>,
    destruct: Destructor<K, V>,
    state: Mutex<LruState<K, V>>,
}

impl<K, V> AsyncLru<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a map holding at most `capacity` live entries.
    pub fn new<C, D>(capacity: usize, construct: C, destruct: D) -> Arc<Self>
    where
        C: Fn(K) -> BoxFuture<'static, Result<Arc<V>, SharedError>> + Send + Sync + 'static,
        D: Fn(K, Arc<V>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        assert!(capacity > 0, "AsyncLru capacity must be positive");
        Arc::new(Self {
            capacity,
            construct: Arc::new(construct),
            destruct: Arc::new(destruct),
            state: Mutex::new(LruState {
                order: Vec::new(),
                cache: HashMap::new(),
                destructions: HashMap::new(),
            }),
        })
    }

    /// Number of live (cached) entries.
    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Whether the map holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, constructing the value if needed.
    ///
    /// A fresh construction is chained behind any still-running destruction
    /// of the same key. May trigger a background eviction of the
    /// least-recently-used entry.
    pub async fn get(self: &Arc<Self>, key: K) -> Result<Arc<V>, SharedError> {
        self.get_future(key).await
    }

    fn get_future(self: &Arc<Self>, key: K) -> ConstructFuture<V> {
        let (fut, evict) = {
            let mut st = self.state.lock();

            if let Some(existing) = st.cache.get(&key) {
                let fut = existing.clone();
                st.order.retain(|k| k != &key);
                st.order.push(key);
                return fut;
            }

            let pending_destruction = st.destructions.get(&key).cloned();
            let construct = self.construct.clone();
            let fut: ConstructFuture<V> = {
                let key = key.clone();
                async move {
                    if let Some(d) = pending_destruction {
                        d.await;
                    }
                    construct(key).await
                }
                .boxed()
                .shared()
            };

            st.cache.insert(key.clone(), fut.clone());
            st.order.push(key.clone());

            let evict = (st.cache.len() > self.capacity)
                .then(|| st.order.first().expect("order tracks cache").clone());
            (fut, evict)
        };

        // Drive the construction to completion even if every caller goes
        // away, and drop the entry again if the constructor fails.
        {
            let this = Arc::downgrade(self);
            let watched = fut.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if watched.clone().await.is_err() {
                    if let Some(lru) = this.upgrade() {
                        let mut st = lru.state.lock();
                        let unchanged = st
                            .cache
                            .get(&key)
                            .map(|e| e.ptr_eq(&watched))
                            .unwrap_or(false);
                        if unchanged {
                            st.cache.remove(&key);
                            st.order.retain(|k| k != &key);
                        }
                    }
                }
            });
        }

        if let Some(victim) = evict {
            let _ = self.delete(&victim);
        }

        fut
    }

    /// Remove `key`, destroying its value in the background.
    ///
    /// Returns a future resolving when the destruction has finished. If the
    /// key is absent, returns the in-flight destruction if one exists and an
    /// already-resolved future otherwise.
    pub fn delete(self: &Arc<Self>, key: &K) -> DestructFuture {
        let mut st = self.state.lock();

        if let Some(entry) = st.cache.remove(key) {
            st.order.retain(|k| k != key);

            let destruct = self.destruct.clone();
            let this = Arc::downgrade(self);
            let key2 = key.clone();
            let fut: DestructFuture = async move {
                if let Ok(value) = entry.await {
                    destruct(key2.clone(), value).await;
                }
                if let Some(lru) = this.upgrade() {
                    lru.state.lock().destructions.remove(&key2);
                }
            }
            .boxed()
            .shared();

            st.destructions.insert(key.clone(), fut.clone());
            tokio::spawn(fut.clone());
            fut
        } else if let Some(pending) = st.destructions.get(key) {
            pending.clone()
        } else {
            futures::future::ready(()).boxed().shared()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_lru(capacity: usize, destruct_delay: Duration) -> (Arc<AsyncLru<String, usize>>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let seq = Arc::new(AtomicUsize::new(0));

        let c_log = log.clone();
        let d_log = log.clone();
        let lru = AsyncLru::new(
            capacity,
            move |key: String| {
                let log = c_log.clone();
                let n = seq.fetch_add(1, Ordering::SeqCst);
                async move {
                    log.lock().push(format!("construct {key} -> {n}"));
                    Ok(Arc::new(n))
                }
                .boxed()
            },
            move |key: String, value: Arc<usize>| {
                let log = d_log.clone();
                async move {
                    tokio::time::sleep(destruct_delay).await;
                    log.lock().push(format!("destruct {key} -> {value}"));
                }
                .boxed()
            },
        );
        (lru, log)
    }

    #[tokio::test]
    async fn repeated_gets_share_one_value() {
        let (lru, log) = logging_lru(4, Duration::ZERO);
        let a = lru.get("a".to_string()).await.unwrap();
        let b = lru.get("a".to_string()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn eviction_destroys_least_recently_used() {
        let (lru, log) = logging_lru(2, Duration::ZERO);
        lru.get("a".to_string()).await.unwrap();
        lru.get("b".to_string()).await.unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        lru.get("a".to_string()).await.unwrap();
        lru.get("c".to_string()).await.unwrap();

        lru.delete(&"b".to_string()).await;
        assert_eq!(lru.len(), 2);
        assert!(log.lock().iter().any(|l| l.starts_with("destruct b")));
        assert!(!log.lock().iter().any(|l| l.starts_with("destruct a")));
    }

    #[tokio::test]
    async fn reconstruction_waits_for_destruction() {
        let (lru, log) = logging_lru(2, Duration::from_millis(50));
        let v0 = lru.get("a".to_string()).await.unwrap();
        lru.delete(&"a".to_string());

        // Re-request immediately; the new constructor must run only after
        // the slow destructor has finished.
        let v1 = lru.get("a".to_string()).await.unwrap();
        assert_ne!(v0, v1);

        let entries = log.lock().clone();
        let destruct_pos = entries
            .iter()
            .position(|l| l.starts_with("destruct a"))
            .expect("destructor ran");
        let reconstruct_pos = entries
            .iter()
            .position(|l| l == &format!("construct a -> {v1}"))
            .expect("constructor ran again");
        assert!(destruct_pos < reconstruct_pos, "log: {entries:?}");
    }

    #[tokio::test]
    async fn destructor_sees_the_constructed_value() {
        let (lru, log) = logging_lru(2, Duration::ZERO);
        let v = lru.get("a".to_string()).await.unwrap();
        lru.delete(&"a".to_string()).await;
        assert!(log
            .lock()
            .iter()
            .any(|l| l == &format!("destruct a -> {v}")));
    }

    #[tokio::test]
    async fn delete_of_absent_key_resolves_immediately() {
        let (lru, log) = logging_lru(2, Duration::ZERO);
        lru.delete(&"missing".to_string()).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_construction_is_retried_on_next_get() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let lru = AsyncLru::new(
            2,
            move |_key: String| {
                let n = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Arc::new(Error::Internal("first attempt fails".into())))
                    } else {
                        Ok(Arc::new(n))
                    }
                }
                .boxed()
            },
            |_key: String, _v: Arc<usize>| async move {}.boxed(),
        );

        assert!(lru.get("a".to_string()).await.is_err());

        // The failure watcher runs on a spawned task; give it a beat.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lru.len(), 0);

        let v = lru.get("a".to_string()).await.unwrap();
        assert_eq!(*v, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
