//! Request deduplication and per-key serialization.
//!
//! [`FetchCoordinator`] keeps at most one fetch in flight per key: callers that
//! arrive while a fetch for their key is pending await the same shared handle
//! and receive the very same result (or error). The entry belongs to the
//! shared fetch: it is removed when that fetch resolves, or when every caller
//! awaiting it has gone away.
//!
//! [`KeyedSerializer`] runs operations on the same key one after another.

use crate::common::sync::lock;
use crate::error::Result;
use crate::telemetry::{Event, Telemetry};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::lock::{Mutex as AsyncMutex, OwnedMutexGuard};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;
type InFlightMap<K, T> = Arc<Mutex<HashMap<K, InFlight<T>>>>;

struct InFlight<T>
where
    T: Clone,
{
    id: u64,
    fetch: SharedFetch<T>,
}

pub struct FetchCoordinator<K, T>
where
    T: Clone,
{
    domain: &'static str,
    telemetry: Arc<dyn Telemetry>,
    in_flight: InFlightMap<K, T>,
    next_id: AtomicU64,
}

impl<K, T> FetchCoordinator<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(domain: &'static str, telemetry: Arc<dyn Telemetry>) -> Self {
        FetchCoordinator {
            domain,
            telemetry,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `fetch` unless a fetch for `key` is already pending, in which case
    /// the pending result is awaited instead. `fetch` is only invoked to build
    /// the future; it must not call back into this coordinator synchronously.
    pub async fn fetch<F, Fut>(&self, key: K, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut waiter = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key) {
                Some(pending) => {
                    self.telemetry.record(
                        Event::new(self.domain, "fetch.joined").field("key", format!("{key:?}")),
                    );
                    Waiter {
                        in_flight: &*self.in_flight,
                        key,
                        id: pending.id,
                        fetch: pending.fetch.clone(),
                    }
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.settling(key.clone(), id, fetch()).boxed().shared();
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            fetch: shared.clone(),
                        },
                    );
                    self.telemetry.record(
                        Event::new(self.domain, "fetch.started").field("key", format!("{key:?}")),
                    );
                    Waiter {
                        in_flight: &*self.in_flight,
                        key,
                        id,
                        fetch: shared,
                    }
                }
            }
        };

        (&mut waiter.fetch).await
    }

    /// True while any fetch of this domain is pending.
    pub fn is_loading(&self) -> bool {
        !lock(&self.in_flight).is_empty()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Wraps a fetch so that it releases its own entry once it resolves,
    /// whichever caller happens to be driving it at that point.
    fn settling<Fut>(
        &self,
        key: K,
        id: u64,
        fetch: Fut,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let in_flight = self.in_flight.clone();
        let telemetry = self.telemetry.clone();
        let domain = self.domain;
        async move {
            let result = fetch.await;
            finish(&in_flight, &key, id);
            let event = if result.is_ok() { "fetch.completed" } else { "fetch.failed" };
            telemetry.record(Event::new(domain, event).field("key", format!("{key:?}")));
            result
        }
    }
}

fn finish<K, T>(in_flight: &Mutex<HashMap<K, InFlight<T>>>, key: &K, id: u64)
where
    K: Eq + Hash,
    T: Clone,
{
    let mut in_flight = lock(in_flight);
    if in_flight.get(key).map(|p| p.id) == Some(id) {
        in_flight.remove(key);
    }
}

/// One caller's handle on a shared fetch. The last handle to go away before
/// the fetch resolves abandons it and clears the entry.
struct Waiter<'a, K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    in_flight: &'a Mutex<HashMap<K, InFlight<T>>>,
    key: K,
    id: u64,
    fetch: SharedFetch<T>,
}

impl<K, T> Drop for Waiter<'_, K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    fn drop(&mut self) {
        let mut in_flight = lock(self.in_flight);
        // Only this handle and the map's are left: nobody else will drive the fetch.
        let abandoned = in_flight.get(&self.key).is_some_and(|p| p.id == self.id)
            && self.fetch.strong_count() == Some(2);
        if abandoned {
            in_flight.remove(&self.key);
        }
    }
}

/// Counts operations in flight; the count drops when the returned guard does.
#[derive(Debug, Default)]
pub struct Activity {
    active: AtomicUsize,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> ActivityGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard { activity: self }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

pub struct ActivityGuard<'a> {
    activity: &'a Activity,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.activity.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One async lock per key, created on demand and dropped once idle.
pub struct KeyedSerializer<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedSerializer<K> {
    fn default() -> Self {
        KeyedSerializer {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedSerializer<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of `key` remains.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let key_lock = {
            let mut locks = lock(&self.locks);
            locks.retain(|k, l| *k == key || Arc::strong_count(l) > 1);
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        key_lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, Error};
    use crate::telemetry::RecordingTelemetry;

    #[tokio::test]
    async fn entry_is_cleared_after_completion() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let coordinator: FetchCoordinator<String, u32> =
            FetchCoordinator::new("test", telemetry.clone());

        let value = coordinator
            .fetch("a".to_string(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!coordinator.is_loading());
        assert!(!coordinator.is_in_flight(&"a".to_string()));
        assert_eq!(telemetry.count("test", "fetch.started"), 1);
        assert_eq!(telemetry.count("test", "fetch.completed"), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let coordinator: FetchCoordinator<u8, u8> = FetchCoordinator::new("test", telemetry.clone());

        let (a, b) = tokio::join!(
            coordinator.fetch(1, || async {
                tokio::task::yield_now().await;
                Ok(1)
            }),
            coordinator.fetch(2, || async {
                tokio::task::yield_now().await;
                Ok(2)
            }),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(telemetry.count("test", "fetch.started"), 2);
        assert_eq!(telemetry.count("test", "fetch.joined"), 0);
    }

    #[tokio::test]
    async fn dropped_originator_clears_entry() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let coordinator: FetchCoordinator<(), u8> = FetchCoordinator::new("test", telemetry);

        {
            let fut = coordinator.fetch((), || futures::future::pending());
            futures::pin_mut!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
            assert!(coordinator.is_loading());
        }
        assert!(!coordinator.is_loading());
    }

    #[tokio::test]
    async fn joiner_keeps_fetch_alive_after_originator_drops() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let coordinator: FetchCoordinator<(), u8> = FetchCoordinator::new("test", telemetry.clone());
        let started = AtomicUsize::new(0);
        let (release, released) = futures::channel::oneshot::channel::<()>();

        let mut originator = Box::pin(coordinator.fetch((), || {
            started.fetch_add(1, Ordering::SeqCst);
            async move {
                released
                    .await
                    .map(|()| 5)
                    .map_err(|_| Error::from(BackendError::new("cancelled")))
            }
        }));
        let mut joiner = Box::pin(coordinator.fetch((), || {
            started.fetch_add(1, Ordering::SeqCst);
            async { Ok(0) }
        }));
        assert!(futures::poll!(originator.as_mut()).is_pending());
        assert!(futures::poll!(joiner.as_mut()).is_pending());

        drop(originator);
        assert!(coordinator.is_in_flight(&()));

        let mut third = Box::pin(coordinator.fetch((), || {
            started.fetch_add(1, Ordering::SeqCst);
            async { Ok(0) }
        }));
        assert!(futures::poll!(third.as_mut()).is_pending());

        release.send(()).unwrap();
        let (joined, late) = tokio::join!(joiner, third);

        assert_eq!((joined.unwrap(), late.unwrap()), (5, 5));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.count("test", "fetch.joined"), 2);
        assert_eq!(telemetry.count("test", "fetch.completed"), 1);
        assert!(!coordinator.is_loading());
    }

    #[test]
    fn activity_guard_resets() {
        let activity = Activity::new();
        {
            let _first = activity.start();
            let _second = activity.start();
            assert!(activity.is_active());
        }
        assert!(!activity.is_active());
    }

    #[tokio::test]
    async fn serializer_orders_same_key() {
        let serializer: KeyedSerializer<&str> = KeyedSerializer::new();
        let log = Mutex::new(Vec::new());

        let run = |tag: &'static str| {
            let serializer = &serializer;
            let log = &log;
            async move {
                let _guard = serializer.acquire("k").await;
                lock(log).push(format!("{tag}-start"));
                tokio::task::yield_now().await;
                lock(log).push(format!("{tag}-end"));
            }
        };
        tokio::join!(run("a"), run("b"));

        assert_eq!(
            *lock(&log),
            vec!["a-start", "a-end", "b-start", "b-end"]
        );
    }
}
