//! Single-flight fetches with debounce.
//!
//! At most one fetch is pending per key. A pending fetch is either still
//! debouncing (its deadline moves with every new request) or in flight on a
//! spawned task. Callers always receive a shared future and all of them
//! observe the same result.
//!
//! ```text
//!            request(debounce > 0)              deadline reached
//! (none) ──────────────────────────► Debouncing ────────────────► InFlight ──► (none)
//!    │                                  ▲   │ request: deadline reset,          │
//!    │ request(debounce = 0)            └───┘ latest producer wins              │ store written,
//!    └──────────────────────────────────────────────────────────► InFlight ─────┘ marker cleared
//! ```
//!
//! Each in-flight fetch holds a [`WriteClaim`] on its key. An invalidation
//! of the key supersedes the claim: the result still reaches the fetch's
//! waiters but is not stored, and later requests queue one follow-up fetch
//! behind it instead of joining it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use qalam_core::{CacheError, FetchConfig, QalamError, QalamResult};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::keyspace::TtlRule;
use crate::stats::FetchStats;
use crate::ttl_store::{TtlStore, WriteClaim};

/// Future shared by every caller waiting on one key.
pub type FetchFuture<V> = Shared<BoxFuture<'static, QalamResult<V>>>;

type Producer<V> = Box<dyn FnOnce() -> BoxFuture<'static, QalamResult<V>> + Send>;

struct DebounceWindow<V> {
    deadline: Instant,
    /// Bound measured from the first request of the burst.
    hard_deadline: Instant,
    producer: Option<Producer<V>>,
    ttl: TtlRule<V>,
    notify: Arc<Notify>,
}

enum Phase<V> {
    /// Held weakly so the window dies with its last waiter.
    Debouncing {
        fetch: WeakShared<BoxFuture<'static, QalamResult<V>>>,
        window: Arc<Mutex<DebounceWindow<V>>>,
    },
    InFlight {
        fetch: FetchFuture<V>,
        claim: Arc<WriteClaim>,
    },
}

struct PendingFetch<V> {
    id: u64,
    scheduled_at: Instant,
    phase: Phase<V>,
}

impl<V> PendingFetch<V> {
    /// False for a debounce marker whose every waiter is gone.
    fn is_live(&self) -> bool {
        match &self.phase {
            Phase::Debouncing { fetch, .. } => fetch.upgrade().is_some(),
            Phase::InFlight { .. } => true,
        }
    }
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    joined: AtomicU64,
    coalesced: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
}

struct CoordinatorInner<V> {
    store: TtlStore<V>,
    config: FetchConfig,
    pending: Mutex<HashMap<String, PendingFetch<V>>>,
    /// Consecutive failures per key, for backoff.
    failures: Mutex<HashMap<String, u32>>,
    next_id: AtomicU64,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Fire<V> {
    /// The deadline moved while the lock was being acquired.
    Wait,
    Fired(FetchFuture<V>),
    Cancelled,
}

impl<V> CoordinatorInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start the producer on its own task so that no caller going away can
    /// cancel a fetch other callers depend on.
    fn spawn_fetch(
        self: &Arc<Self>,
        key: &str,
        id: u64,
        producer: Producer<V>,
        ttl: TtlRule<V>,
    ) -> (FetchFuture<V>, Arc<WriteClaim>) {
        let claim = Arc::new(self.store.claim(key));
        let task_claim = Arc::clone(&claim);
        let failures = lock(&self.failures).get(key).copied().unwrap_or(0);
        let delay = self.config.backoff.delay_for(failures);
        let timeout = self.config.fetch_timeout;
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        let task_key = key.to_string();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(
                    key = %task_key,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before fetch"
                );
                tokio::time::sleep(delay).await;
            }
            debug!(key = %task_key, "Fetch started");
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, producer()).await {
                    Ok(result) => result,
                    Err(_) => {
                        inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        Err(CacheError::Timeout {
                            key: task_key.clone(),
                            timeout: limit,
                        }
                        .into())
                    }
                },
                None => producer().await,
            };
            inner.complete(&task_key, id, &task_claim, &ttl, result)
        });

        let join_key = key.to_string();
        let fetch = task
            .map(move |joined| match joined {
                Ok(result) => result,
                Err(e) => Err(QalamError::Cache(CacheError::Cancelled {
                    key: join_key,
                    reason: e.to_string(),
                })),
            })
            .boxed()
            .shared();
        (fetch, claim)
    }

    /// Store first, then clear the marker, so a caller arriving in between
    /// either joins this fetch or finds the value.
    fn complete(
        &self,
        key: &str,
        id: u64,
        claim: &WriteClaim,
        ttl: &TtlRule<V>,
        result: QalamResult<V>,
    ) -> QalamResult<V> {
        match &result {
            Ok(value) => {
                let ttl = ttl.ttl_for(value);
                lock(&self.failures).remove(key);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                if self.store.commit(claim, value.clone(), ttl) {
                    debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Fetch completed");
                } else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Key invalidated during fetch, result not stored");
                }
            }
            Err(e) => {
                let failures = {
                    let mut failures = lock(&self.failures);
                    let count = failures.entry(key.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, failures, "Fetch failed, nothing cached");
            }
        }

        let mut pending = lock(&self.pending);
        if pending.get(key).is_some_and(|p| p.id == id) {
            pending.remove(key);
        }
        result
    }

    fn try_fire(self: &Arc<Self>, key: &str, id: u64, window: &Mutex<DebounceWindow<V>>) -> Fire<V> {
        let mut pending = lock(&self.pending);
        let Some(entry) = pending.get_mut(key).filter(|p| p.id == id) else {
            return Fire::Cancelled;
        };
        let (producer, ttl) = {
            let mut window = lock(window);
            if Instant::now() < window.deadline {
                return Fire::Wait;
            }
            (window.producer.take(), window.ttl.clone())
        };
        let Some(producer) = producer else {
            return Fire::Cancelled;
        };

        let waited = Instant::now().saturating_duration_since(entry.scheduled_at);
        debug!(key = %key, waited_ms = waited.as_millis() as u64, "Debounce window closed");
        let (fetch, claim) = self.spawn_fetch(key, id, producer, ttl);
        entry.phase = Phase::InFlight {
            fetch: fetch.clone(),
            claim,
        };
        Fire::Fired(fetch)
    }

    /// Body of a debouncing fetch: wait for quiescence, then fire.
    async fn debounce(
        self: Arc<Self>,
        key: String,
        id: u64,
        window: Arc<Mutex<DebounceWindow<V>>>,
    ) -> QalamResult<V> {
        let mut guard = AbandonGuard {
            inner: Arc::clone(&self),
            key: key.clone(),
            id,
            armed: true,
        };

        loop {
            let (deadline, notify) = {
                let window = lock(&window);
                (window.deadline, Arc::clone(&window.notify))
            };
            if Instant::now() < deadline {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = notify.notified() => {}
                }
                continue;
            }

            match self.try_fire(&key, id, &window) {
                Fire::Wait => continue,
                Fire::Fired(fetch) => {
                    guard.armed = false;
                    return fetch.await;
                }
                Fire::Cancelled => {
                    return Err(CacheError::Cancelled {
                        key,
                        reason: "debounce cancelled".to_string(),
                    }
                    .into());
                }
            }
        }
    }
}

/// Drops the pending marker when every waiter of a debouncing fetch is gone.
struct AbandonGuard<V> {
    inner: Arc<CoordinatorInner<V>>,
    key: String,
    id: u64,
    armed: bool,
}

impl<V> Drop for AbandonGuard<V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pending = lock(&self.inner.pending);
        let abandoned = pending
            .get(&self.key)
            .is_some_and(|p| p.id == self.id && matches!(p.phase, Phase::Debouncing { .. }));
        if abandoned {
            pending.remove(&self.key);
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, "Debounce abandoned by every waiter");
        }
    }
}

/// Coordinates fetches so that each key has at most one pending fetch.
///
/// Successful results are written to the shared [`TtlStore`] with the TTL
/// decided by the request's [`TtlRule`], unless the key was invalidated
/// while the fetch ran. Failures reach every waiter and leave the store
/// untouched. Repeated failures for a key are spaced out by the configured
/// backoff.
pub struct FetchCoordinator<V> {
    inner: Arc<CoordinatorInner<V>>,
}

impl<V> Clone for FetchCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> FetchCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: TtlStore<V>, config: FetchConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                config,
                pending: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn store(&self) -> &TtlStore<V> {
        &self.inner.store
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Join the pending fetch for `key`, or start one.
    ///
    /// The pending marker is checked and set before this returns, so
    /// concurrent callers can never both start a fetch. With a non-zero
    /// `debounce` (capped at `max_debounce_window`) the producer runs once
    /// the key has been quiet for `debounce`; each request arriving during
    /// the window resets it and replaces the producer, up to
    /// `max_debounce_wait` after the first request. A zero-debounce request
    /// arriving during a window makes it fire at once. Requests arriving
    /// while a fetch is in flight join it and their producer is dropped,
    /// unless the key was invalidated after that fetch started: the request
    /// then waits for it to settle and makes its own request, so at most one
    /// fetch is ever in flight and the follow-up reads after the change.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn fetch_or_join<F, Fut>(
        &self,
        key: &str,
        ttl: TtlRule<V>,
        producer: F,
        debounce: Duration,
    ) -> FetchFuture<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = QalamResult<V>> + Send + 'static,
    {
        self.request(key, ttl, Box::new(move || producer().boxed()), debounce)
    }

    fn request(&self, key: &str, ttl: TtlRule<V>, producer: Producer<V>, debounce: Duration) -> FetchFuture<V> {
        let debounce = debounce.min(self.inner.config.max_debounce_window);
        let now = Instant::now();

        let mut pending = lock(&self.inner.pending);
        let producer = match pending.get(key).map(|p| &p.phase) {
            Some(Phase::InFlight { fetch, claim }) if claim.is_superseded() => {
                self.inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "In-flight fetch predates an invalidation, follow-up queued");
                let superseded = fetch.clone();
                let coordinator = self.clone();
                let key = key.to_string();
                return async move {
                    // Its outcome belongs to the old state either way.
                    let _ = superseded.await;
                    coordinator.request(&key, ttl, producer, debounce).await
                }
                .boxed()
                .shared();
            }
            Some(Phase::InFlight { fetch, .. }) => {
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Joined in-flight fetch");
                return fetch.clone();
            }
            Some(Phase::Debouncing { fetch, window }) => match fetch.upgrade() {
                Some(fetch) => {
                    let mut window = lock(window);
                    window.deadline = (now + debounce).min(window.hard_deadline);
                    window.producer = Some(producer);
                    window.ttl = ttl;
                    window.notify.notify_one();
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %key,
                        debounce_ms = debounce.as_millis() as u64,
                        "Debounce window reset"
                    );
                    return fetch;
                }
                // Every waiter left; the marker is replaced below.
                None => producer,
            },
            None => producer,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if debounce.is_zero() {
            let (fetch, claim) = self.inner.spawn_fetch(key, id, producer, ttl);
            pending.insert(
                key.to_string(),
                PendingFetch {
                    id,
                    scheduled_at: now,
                    phase: Phase::InFlight {
                        fetch: fetch.clone(),
                        claim,
                    },
                },
            );
            return fetch;
        }

        let window = Arc::new(Mutex::new(DebounceWindow {
            deadline: now + debounce,
            hard_deadline: now + self.inner.config.max_debounce_wait.max(debounce),
            producer: Some(producer),
            ttl,
            notify: Arc::new(Notify::new()),
        }));
        let fetch = Arc::clone(&self.inner)
            .debounce(key.to_string(), id, Arc::clone(&window))
            .boxed()
            .shared();
        if let Some(weak) = fetch.downgrade() {
            pending.insert(
                key.to_string(),
                PendingFetch {
                    id,
                    scheduled_at: now,
                    phase: Phase::Debouncing {
                        fetch: weak,
                        window,
                    },
                },
            );
        }
        debug!(key = %key, debounce_ms = debounce.as_millis() as u64, "Debounce window opened");
        fetch
    }

    /// Cancel a debounce window before it fires. Its waiters receive
    /// [`CacheError::Cancelled`]. Fetches already in flight are never
    /// cancelled.
    pub fn cancel_debounce(&self, key: &str) -> bool {
        let mut pending = lock(&self.inner.pending);
        let window = match pending.get(key).map(|p| &p.phase) {
            Some(Phase::Debouncing { window, .. }) => Arc::clone(window),
            _ => return false,
        };
        pending.remove(key);

        let mut window = lock(&window);
        window.producer = None;
        window.deadline = Instant::now();
        window.notify.notify_one();
        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Debounce cancelled");
        true
    }

    /// Whether a fetch for `key` is debouncing or in flight. A debounce
    /// window whose every waiter is gone does not count.
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.inner.pending)
            .get(key)
            .is_some_and(PendingFetch::is_live)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending)
            .values()
            .filter(|p| p.is_live())
            .count()
    }

    /// Consecutive failures recorded for `key`.
    pub fn failure_count(&self, key: &str) -> u32 {
        lock(&self.inner.failures).get(key).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> FetchStats {
        let c = &self.inner.counters;
        FetchStats {
            started: c.started.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}
