use crate::error::{ErrorKind, Result};
use crate::priority::Priority;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, BinaryHeap};
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::{Notify, watch};

type Compute<V, K> = Arc<dyn Fn(Priority, String) -> BoxFuture<'static, std::result::Result<V, exn::Exn<K>>> + Send + Sync>;
type Outcome<V, K> = std::result::Result<V, ErrorKind<K>>;
type OutcomeReceiver<V, K> = watch::Receiver<Option<Outcome<V, K>>>;

struct Cached<V> {
    value: V,
    priority: Priority,
    /// Sequence number the entry is filed under in the eviction index.
    filed: u64,
    /// Sequence number of the most recent hit.
    touched: AtomicU64,
}

struct Flight<V, K> {
    priority: AtomicI64,
    started: AtomicBool,
    outcome: watch::Sender<Option<Outcome<V, K>>>,
}

#[derive(Debug, PartialEq, Eq)]
struct Job {
    priority: Priority,
    seq: u64,
    id: String,
}
impl Ord for Job {
    // Max-heap: highest priority first, then FIFO.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

enum Lookup<V, K> {
    Hit(V),
    Wait(OutcomeReceiver<V, K>),
}

struct Shared<V, K: StdError + Send + Sync + 'static> {
    compute: Compute<V, K>,
    capacity: usize,
    entries: DashMap<String, Cached<V>>,
    /// Eviction order: lowest priority first, oldest first within a priority.
    /// Entries hit since they were filed are re-filed lazily when they reach
    /// the front, so the hit path never takes this lock.
    index: Mutex<BTreeSet<(Priority, u64, String)>>,
    flights: DashMap<String, Arc<Flight<V, K>>>,
    queue: Mutex<BinaryHeap<Job>>,
    wakeup: Notify,
    sequence: AtomicU64,
    closed: AtomicBool,
}

/// A capacity-bounded cache that computes missing values on demand.
///
/// - On a hit, [`get()`](Self::get) returns immediately.
/// - On a miss, exactly one computation is queued; every concurrent
///   [`get()`](Self::get) or [`warm()`](Self::warm) for the same id waits on
///   it and observes the same value or error.
/// - Successful values are retained up to `capacity` entries, evicting the
///   lowest priority (then least recently used) entry first. A capacity of
///   zero retains nothing, so every access recomputes (still deduplicated
///   across concurrent callers). Failures are never retained.
/// - At most `parallelism` computations run at once; the rest wait in a
///   priority queue.
///
/// Must be created from within a Tokio runtime: the worker pool is spawned
/// on construction. Dropping the cache closes it.
///
/// # Examples
///
/// ```
/// use diffcache_rtcache::ReadThroughCache;
///
/// # #[derive(Debug, Clone)]
/// # struct NeverFails;
/// # impl std::fmt::Display for NeverFails {
/// #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("never") }
/// # }
/// # impl std::error::Error for NeverFails {}
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = ReadThroughCache::new(
///     |_priority, id: String| async move { Ok::<_, exn::Exn<NeverFails>>(id.len()) },
///     1024,
///     4,
/// );
/// assert_eq!(cache.get(0, "four").await.unwrap(), 4);
/// # }
/// ```
pub struct ReadThroughCache<V, K: StdError + Send + Sync + 'static> {
    shared: Arc<Shared<V, K>>,
}

impl<V, K> ReadThroughCache<V, K>
where
    V: Clone + Send + Sync + 'static,
    K: StdError + Clone + Send + Sync + 'static,
{
    /// Create a cache around `compute`, retaining at most `capacity` values
    /// and running at most `parallelism` computations concurrently.
    pub fn new<F, Fut>(compute: F, capacity: usize, parallelism: usize) -> Self
    where
        F: Fn(Priority, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<V, exn::Exn<K>>> + Send + 'static,
    {
        let compute: Compute<V, K> = Arc::new(move |priority, id| compute(priority, id).boxed());
        let shared = Arc::new(Shared {
            compute,
            capacity,
            entries: DashMap::new(),
            index: Mutex::new(BTreeSet::new()),
            flights: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        for _ in 0..parallelism.max(1) {
            tokio::spawn(Arc::clone(&shared).run_worker());
        }
        tracing::debug!(capacity, parallelism, "Read-through cache started");
        Self { shared }
    }

    /// Get the value for `id`, computing it if necessary.
    pub async fn get(&self, priority: Priority, id: &str) -> Result<V, K> {
        match self.shared.lookup_or_join(priority, id)? {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(receiver) => Ok(Shared::wait(receiver).await?),
        }
    }

    /// Make sure the value for `id` is computed (joining a computation that
    /// is already in flight), without handing the value back.
    pub async fn warm(&self, priority: Priority, id: &str) -> Result<(), K> {
        self.get(priority, id).await.map(|_| ())
    }

    /// Whether a value for `id` is currently retained.
    pub fn contains(&self, id: &str) -> bool {
        self.shared.entries.contains_key(id)
    }

    /// Number of retained values.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Drop retained values. Computations in flight are unaffected.
    pub fn remove<S: AsRef<str>>(&self, ids: &[S]) {
        let mut index = self.shared.index.lock();
        for id in ids {
            if let Some((id, cached)) = self.shared.entries.remove(id.as_ref()) {
                index.remove(&(cached.priority, cached.filed, id));
            }
        }
    }

    /// Stop the worker pool.
    ///
    /// Computations already running finish and deliver their result. Queued
    /// computations are abandoned and their waiters receive
    /// [`Closed`](ErrorKind::Closed), as does every later miss. Retained
    /// values can still be read.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wakeup.notify_waiters();
        let abandoned = std::mem::take(&mut *self.shared.queue.lock());
        for job in abandoned {
            let removed = self.shared.flights.remove_if(&job.id, |_, flight| !flight.started.load(Ordering::SeqCst));
            if let Some((_, flight)) = removed {
                flight.outcome.send_replace(Some(Err(ErrorKind::Closed)));
            }
        }
        tracing::debug!("Read-through cache closed");
    }
}

impl<V, K: StdError + Send + Sync + 'static> Drop for ReadThroughCache<V, K> {
    fn drop(&mut self) {
        // Workers hold their own handle on the shared state; without this
        // they would wait for work forever.
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.wakeup.notify_waiters();
        }
    }
}

impl<V, K> Shared<V, K>
where
    V: Clone + Send + Sync + 'static,
    K: StdError + Clone + Send + Sync + 'static,
{
    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, id: &str) -> Option<V> {
        let cached = self.entries.get(id)?;
        cached.touched.store(self.next_seq(), Ordering::Relaxed);
        Some(cached.value.clone())
    }

    fn lookup_or_join(&self, priority: Priority, id: &str) -> std::result::Result<Lookup<V, K>, ErrorKind<K>> {
        if let Some(value) = self.lookup(id) {
            return Ok(Lookup::Hit(value));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::Closed);
        }
        match self.flights.entry(id.to_string()) {
            MapEntry::Occupied(occupied) => {
                let flight = occupied.get();
                let previous = flight.priority.fetch_max(priority, Ordering::SeqCst);
                if priority > previous && !flight.started.load(Ordering::SeqCst) {
                    // Promote: the stale, lower priority job is skipped once
                    // the flight has started.
                    self.enqueue(priority, id);
                }
                Ok(Lookup::Wait(flight.outcome.subscribe()))
            },
            MapEntry::Vacant(vacant) => {
                // A computation may have completed between the lookup above
                // and taking the shard lock.
                if let Some(value) = self.lookup(id) {
                    return Ok(Lookup::Hit(value));
                }
                let (outcome, receiver) = watch::channel(None);
                vacant.insert(Arc::new(Flight {
                    priority: AtomicI64::new(priority),
                    started: AtomicBool::new(false),
                    outcome,
                }));
                self.enqueue(priority, id);
                Ok(Lookup::Wait(receiver))
            },
        }
    }

    fn enqueue(&self, priority: Priority, id: &str) {
        let seq = self.next_seq();
        self.queue.lock().push(Job { priority, seq, id: id.to_string() });
        self.wakeup.notify_one();
    }

    async fn wait(mut receiver: OutcomeReceiver<V, K>) -> Outcome<V, K> {
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(ErrorKind::Closed)),
            // The sender went away without an outcome: the runtime is
            // shutting down underneath us.
            Err(_) => Err(ErrorKind::Closed),
        }
    }

    async fn run_worker(self: Arc<Self>) {
        while let Some(job) = self.next_job().await {
            self.run(job).await;
        }
    }

    async fn next_job(&self) -> Option<Job> {
        loop {
            // Register interest before checking, so a push between the check
            // and the await isn't missed.
            let notified = self.wakeup.notified();
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = self.queue.lock().pop() {
                return Some(job);
            }
            notified.await;
        }
    }

    async fn run(&self, job: Job) {
        let Some(flight) = self.flights.get(&job.id).map(|flight| Arc::clone(flight.value())) else {
            return;
        };
        if flight.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let priority = flight.priority.load(Ordering::SeqCst);
        let computation = (self.compute)(priority, job.id.clone());
        let outcome = match AssertUnwindSafe(computation).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::debug!(id = %job.id, error = ?err, "Computation failed");
                Err(ErrorKind::Compute((*err).clone()))
            },
            Err(_) => {
                tracing::error!(id = %job.id, "Computation panicked");
                Err(ErrorKind::Panicked)
            },
        };
        if let Ok(value) = &outcome {
            self.insert(priority, &job.id, value.clone());
        }
        // Retain first, then retire the flight: a caller arriving in between
        // finds either the flight or the value.
        self.flights.remove_if(&job.id, |_, current| Arc::ptr_eq(current, &flight));
        flight.outcome.send_replace(Some(outcome));
    }

    fn insert(&self, priority: Priority, id: &str, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut index = self.index.lock();
        let seq = self.next_seq();
        let cached = Cached {
            value,
            priority,
            filed: seq,
            touched: AtomicU64::new(seq),
        };
        if let Some(previous) = self.entries.insert(id.to_string(), cached) {
            index.remove(&(previous.priority, previous.filed, id.to_string()));
        }
        index.insert((priority, seq, id.to_string()));
        while self.entries.len() > self.capacity {
            let Some((victim_priority, filed, victim)) = index.pop_first() else {
                break;
            };
            let touched = match self.entries.get(&victim) {
                Some(cached) if cached.filed == filed => cached.touched.load(Ordering::Relaxed),
                // Stale index entry.
                _ => continue,
            };
            if touched > filed {
                if let Some(mut cached) = self.entries.get_mut(&victim) {
                    cached.filed = touched;
                }
                index.insert((victim_priority, touched, victim));
            } else {
                self.entries.remove(&victim);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use derive_more::{Display, Error};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
    enum TestError {
        #[display("no value for {_0}")]
        Missing(#[error(not(source))] String),
    }

    type TestCache = ReadThroughCache<String, TestError>;

    /// Cache whose compute function uppercases the id after a short delay,
    /// failing for ids starting with `missing`.
    fn counting_cache(capacity: usize, parallelism: usize) -> (TestCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = ReadThroughCache::new(
            move |_priority, id: String| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if id.starts_with("missing") {
                        exn::bail!(TestError::Missing(id));
                    }
                    Ok(id.to_uppercase())
                }
            },
            capacity,
            parallelism,
        );
        (cache, calls)
    }

    #[tokio::test]
    async fn test_get_computes_once_then_hits() {
        let (cache, calls) = counting_cache(10, 2);
        assert_eq!(cache.get(0, "abc").await.unwrap(), "ABC");
        assert_eq!(cache.get(0, "abc").await.unwrap(), "ABC");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains("abc"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_computation() {
        let (cache, calls) = counting_cache(10, 4);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get(0, "shared").await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "SHARED");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_warm_and_get_join_the_same_computation() {
        let (cache, calls) = counting_cache(10, 1);
        let (warmed, value) = tokio::join!(cache.warm(0, "joined"), cache.get(5, "joined"));
        warmed.unwrap();
        assert_eq!(value.unwrap(), "JOINED");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_recomputes_but_dedups() {
        let (cache, calls) = counting_cache(0, 2);
        let (a, b) = tokio::join!(cache.get(0, "x"), cache.get(0, "x"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.get(0, "x").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_errors_reach_every_waiter_and_are_not_retained() {
        let (cache, calls) = counting_cache(10, 2);
        let (a, b) = tokio::join!(cache.get(0, "missing-1"), cache.get(0, "missing-1"));
        for result in [a, b] {
            let err = result.unwrap_err();
            assert_eq!(*err, ErrorKind::Compute(TestError::Missing("missing-1".to_string())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(0, "missing-1").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_eviction_prefers_lowest_priority() {
        let (cache, _calls) = counting_cache(2, 1);
        cache.get(10, "important").await.unwrap();
        cache.get(1, "unimportant").await.unwrap();
        cache.get(5, "newcomer").await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("important"));
        assert!(cache.contains("newcomer"));
        assert!(!cache.contains("unimportant"));
    }

    #[tokio::test]
    async fn test_eviction_spares_recently_used() {
        let (cache, calls) = counting_cache(2, 1);
        cache.get(0, "old").await.unwrap();
        cache.get(0, "older").await.unwrap();
        // Touch the oldest entry so the other one becomes the eviction victim.
        cache.get(0, "old").await.unwrap();
        cache.get(0, "new").await.unwrap();
        assert!(cache.contains("old"));
        assert!(!cache.contains("older"));
        assert!(cache.contains("new"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, calls) = counting_cache(10, 1);
        cache.get(0, "a").await.unwrap();
        cache.remove(&["a", "never-cached"]);
        assert!(!cache.contains("a"));
        cache.get(0, "a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_runs_highest_priority_first() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let cache: Arc<TestCache> = {
            let (started, release, order) = (Arc::clone(&started), Arc::clone(&release), Arc::clone(&order));
            Arc::new(ReadThroughCache::new(
                move |_priority, id: String| {
                    let (started, release, order) = (Arc::clone(&started), Arc::clone(&release), Arc::clone(&order));
                    async move {
                        if id == "gate" {
                            started.notify_one();
                            release.notified().await;
                        }
                        order.lock().push(id.clone());
                        Ok(id)
                    }
                },
                10,
                1,
            ))
        };
        let gate = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get(0, "gate").await }
        });
        started.notified().await;
        let low = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get(1, "low").await }
        });
        let high = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get(9, "high").await }
        });
        while cache.shared.queue.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        release.notify_one();
        gate.await.unwrap().unwrap();
        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();
        assert_eq!(*order.lock(), vec!["gate".to_string(), "high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_compute_is_reported() {
        let cache: TestCache = ReadThroughCache::new(
            |_priority, id: String| async move {
                if id == "boom" {
                    panic!("boom");
                }
                Ok(id)
            },
            10,
            1,
        );
        let err = cache.get(0, "boom").await.unwrap_err();
        assert_eq!(*err, ErrorKind::Panicked);
        // The worker survives the panic.
        assert_eq!(cache.get(0, "fine").await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_misses_but_serves_hits() {
        let (cache, _calls) = counting_cache(10, 1);
        cache.get(0, "kept").await.unwrap();
        cache.close();
        assert_eq!(cache.get(0, "kept").await.unwrap(), "KEPT");
        let err = cache.get(0, "new").await.unwrap_err();
        assert_eq!(*err, ErrorKind::Closed);
    }
}
