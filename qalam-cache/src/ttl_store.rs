//! Keyed in-memory store with per-entry expiry timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use qalam_core::CacheConfig;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::freshness::CacheRead;
use crate::keyspace::KeyScope;
use crate::scheduler::{ScheduledTask, Scheduler, TokioScheduler};
use crate::stats::CacheStats;

/// Why an entry left the store without being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCause {
    /// The entry's own expiry timer fired.
    Timer,
    /// A read found the entry too old.
    Access,
}

/// Removal notifications, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Expired { key: String, cause: ExpiryCause },
    Invalidated { key: String },
}

struct Slot<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    /// Binds the expiry timer to this write.
    generation: u64,
    timer: ScheduledTask,
}

impl<V> Slot<V> {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }
}

/// Registry of open write claims.
#[derive(Default)]
struct Claims {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, (String, Arc<AtomicBool>)>>,
}

impl Claims {
    fn open(self: &Arc<Self>, key: String) -> WriteClaim {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let superseded = Arc::new(AtomicBool::new(false));
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (key.clone(), Arc::clone(&superseded)));
        WriteClaim {
            id,
            key,
            superseded,
            claims: Arc::downgrade(self),
        }
    }

    /// Mark every open claim on a matching key as superseded.
    fn supersede<F>(&self, pred: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for (key, superseded) in open.values() {
            if pred(key) && !superseded.swap(true, Ordering::AcqRel) {
                trace!(key = %key, "Open write claim superseded");
                count += 1;
            }
        }
        count
    }

    fn len(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Permission to write one key with a value read from the source of truth.
///
/// Taken before the read. Any write or invalidation of the key afterwards
/// supersedes the claim, and [`TtlStore::commit`] then refuses it, so a value
/// read before a removal never lands after it. Released on drop.
pub struct WriteClaim {
    id: u64,
    key: String,
    superseded: Arc<AtomicBool>,
    claims: Weak<Claims>,
}

impl WriteClaim {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

impl Drop for WriteClaim {
    fn drop(&mut self) {
        if let Some(claims) = self.claims.upgrade() {
            claims
                .open
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

impl std::fmt::Debug for WriteClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteClaim")
            .field("key", &self.key)
            .field("superseded", &self.is_superseded())
            .finish()
    }
}

struct StoreInner<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    claims: Arc<Claims>,
    scheduler: Arc<dyn Scheduler>,
    default_max_age: Duration,
    generation: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl<V> StoreInner<V> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is the common case.
        let _ = self.events.send(event);
    }

    /// Timer callback. Only removes the entry the timer was armed for.
    fn expire_if_current(&self, key: &str, generation: u64) {
        let removed = {
            let mut entries = self.entries();
            match entries.get(key) {
                Some(slot) if slot.generation == generation => entries.remove(key),
                _ => None,
            }
        };
        if let Some(mut slot) = removed {
            slot.timer.disarm();
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, ttl_ms = slot.ttl.as_millis() as u64, "Entry expired");
            self.emit(StoreEvent::Expired {
                key: key.to_string(),
                cause: ExpiryCause::Timer,
            });
        }
    }
}

/// In-memory store holding `(value, inserted_at)` per key.
///
/// Every entry carries its own expiry timer. Writing a key cancels the timer
/// of the value it replaces, and each timer re-checks that it still belongs
/// to the current write before deleting, so an old timer can never evict a
/// newer value. Reads also evict entries found to be stale, which covers
/// stores running without an async runtime.
///
/// Values are cloned out on read; callers never share a cached value.
/// Cloning the store shares its contents.
pub struct TtlStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for TtlStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TtlStore<V>
where
    V: Clone + Send + 'static,
{
    /// Create a store whose plain `get` accepts entries up to
    /// `default_max_age` old.
    pub fn new(default_max_age: Duration) -> Self {
        Self::with_scheduler(default_max_age, Arc::new(TokioScheduler), 128)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_scheduler(
            config.default_max_age,
            Arc::new(TokioScheduler),
            config.event_capacity,
        )
    }

    pub fn with_scheduler(
        default_max_age: Duration,
        scheduler: Arc<dyn Scheduler>,
        event_capacity: usize,
    ) -> Self {
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                claims: Arc::new(Claims::default()),
                scheduler,
                default_max_age,
                generation: AtomicU64::new(0),
                events,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                sets: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
            }),
        }
    }

    pub fn default_max_age(&self) -> Duration {
        self.inner.default_max_age
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry and
    /// its timer. Open claims on `key` are superseded.
    ///
    /// A zero TTL stores nothing and drops whatever the key held.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        self.inner.claims.supersede(|k| k == key);
        self.write(key, value, ttl, None);
    }

    /// Open a claim on `key`. Take it before reading the value that will be
    /// committed.
    pub fn claim(&self, key: impl Into<String>) -> WriteClaim {
        self.inner.claims.open(key.into())
    }

    /// Store `value` under the claimed key unless the claim was superseded.
    ///
    /// Returns whether the value was stored. A zero TTL stores nothing, as
    /// with [`TtlStore::set`].
    pub fn commit(&self, claim: &WriteClaim, value: V, ttl: Duration) -> bool {
        self.write(claim.key.clone(), value, ttl, Some(claim))
    }

    /// Open claims, for diagnostics.
    pub fn open_claims(&self) -> usize {
        self.inner.claims.len()
    }

    /// The superseded check runs under the entries lock. Invalidations
    /// supersede before they take that lock, so a commit either sees the
    /// flag or lands before the removal.
    fn write(&self, key: String, value: V, ttl: Duration, claim: Option<&WriteClaim>) -> bool {
        let superseded = || claim.is_some_and(WriteClaim::is_superseded);
        if ttl.is_zero() {
            let removed = {
                let mut entries = self.inner.entries();
                if superseded() {
                    return false;
                }
                entries.remove(&key)
            };
            debug!(key = %key, replaced = removed.is_some(), "Zero TTL, entry not stored");
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<StoreInner<V>> = Arc::downgrade(&self.inner);
        let timer_key = key.clone();

        let previous = {
            let mut entries = self.inner.entries();
            if superseded() {
                debug!(key = %key, "Key invalidated since claim was taken, value dropped");
                return false;
            }
            let timer = self.inner.scheduler.schedule(
                ttl,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_if_current(&timer_key, generation);
                    }
                }),
            );
            entries.insert(
                key.clone(),
                Slot {
                    value,
                    inserted_at: Instant::now(),
                    ttl,
                    generation,
                    timer,
                },
            )
        };
        if let Some(previous) = previous {
            previous.timer.cancel();
        }

        self.inner.sets.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "Entry stored");
        true
    }

    /// Value for `key` if it is at most `default_max_age` old and within its
    /// own TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_max_age(key, self.inner.default_max_age)
    }

    /// Value for `key` if it is at most `max_age` old and within its own TTL.
    ///
    /// An entry failing either check is evicted, so a caller asking for
    /// stricter freshness also forces the next reader to refetch.
    pub fn get_with_max_age(&self, key: &str, max_age: Duration) -> Option<V> {
        self.get_read(key, max_age).map(CacheRead::into_value)
    }

    /// Value for `key` if it is within its own TTL, whatever the default
    /// max age.
    pub fn peek(&self, key: &str) -> Option<V> {
        self.get_with_max_age(key, Duration::MAX)
    }

    /// Like [`TtlStore::get_with_max_age`], with age metadata.
    pub fn get_read(&self, key: &str, max_age: Duration) -> Option<CacheRead<V>> {
        let now = Instant::now();
        let found = {
            let mut entries = self.inner.entries();
            match entries.get(key) {
                None => Lookup::Missing,
                Some(slot) => {
                    let age = slot.age(now);
                    if age > slot.ttl || age > max_age {
                        Lookup::Stale(entries.remove(key))
                    } else {
                        Lookup::Fresh(CacheRead::new(
                            slot.value.clone(),
                            slot.inserted_at,
                            age,
                            slot.ttl,
                        ))
                    }
                }
            }
        };

        match found {
            Lookup::Fresh(read) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, age_ms = read.age().as_millis() as u64, "Cache hit");
                Some(read)
            }
            Lookup::Stale(slot) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                if slot.is_some() {
                    self.inner.expirations.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Stale entry evicted on read");
                    self.inner.emit(StoreEvent::Expired {
                        key: key.to_string(),
                        cause: ExpiryCause::Access,
                    });
                }
                None
            }
            Lookup::Missing => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Presence check without freshness validation. Diagnostics only.
    pub fn has(&self, key: &str) -> bool {
        self.inner.entries().contains_key(key)
    }

    /// Remove one key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.remove_where(|k| k == key) > 0
    }

    /// Remove every key starting with `prefix`, or everything when `None`.
    /// Returns the number of entries removed.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        match prefix {
            Some(prefix) => self.remove_where(|k| k.starts_with(prefix)),
            None => self.remove_where(|_| true),
        }
    }

    /// Remove every key in `scope`.
    pub fn clear_matching(&self, scope: &KeyScope) -> usize {
        self.remove_where(|k| scope.matches(k))
    }

    /// Supersedes open claims on matching keys even when no entry is
    /// stored yet, then removes the entries.
    fn remove_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let superseded = self.inner.claims.supersede(&pred);
        if superseded > 0 {
            debug!(claims = superseded, "Invalidation superseded in-flight writes");
        }
        let removed: Vec<(String, Slot<V>)> = {
            let mut entries = self.inner.entries();
            let keys: Vec<String> = entries
                .keys()
                .filter(|k| pred(k.as_str()))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|slot| (k, slot)))
                .collect()
        };

        let count = removed.len();
        for (key, slot) in removed {
            slot.timer.cancel();
            self.inner.emit(StoreEvent::Invalidated { key });
        }
        if count > 0 {
            self.inner
                .invalidations
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Number of entries still within their TTL.
    pub fn size(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries()
            .values()
            .filter(|slot| slot.age(now) <= slot.ttl)
            .count()
    }

    /// Sorted snapshot of stored keys, live or not yet evicted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Removal notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entry_count: self.inner.entries().len() as u64,
            sets: self.inner.sets.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
            invalidations: self.inner.invalidations.load(Ordering::Relaxed),
        }
    }
}

enum Lookup<V> {
    Fresh(CacheRead<V>),
    Stale(Option<Slot<V>>),
    Missing,
}
