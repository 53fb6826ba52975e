//! Bulk invalidation and invalidate-then-refetch.

use std::future::Future;
use std::time::Duration;

use qalam_core::{EntityKind, QalamResult, SubjectId};
use tracing::debug;

use crate::coordinator::{FetchCoordinator, FetchFuture};
use crate::keyspace::{EntityKey, KeyScope, TtlRule};
use crate::ttl_store::TtlStore;

/// Removes entries and their timers, optionally refetching right away.
///
/// Invalidating a key that is already absent removes nothing, which keeps
/// duplicate change deliveries harmless. Every invalidation also supersedes
/// fetches in flight for the keys it covers, so a read that began before it
/// is never stored after it.
pub struct InvalidationRouter<V> {
    store: TtlStore<V>,
    coordinator: FetchCoordinator<V>,
}

impl<V> Clone for InvalidationRouter<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<V> InvalidationRouter<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(coordinator: FetchCoordinator<V>) -> Self {
        Self {
            store: coordinator.store().clone(),
            coordinator,
        }
    }

    /// Remove every key starting with `prefix_or_key`.
    pub fn invalidate(&self, prefix_or_key: &str) -> usize {
        let removed = self.store.clear(Some(prefix_or_key));
        debug!(prefix = %prefix_or_key, removed, "Invalidated by prefix");
        removed
    }

    pub fn invalidate_scope(&self, scope: &KeyScope) -> usize {
        let removed = self.store.clear_matching(scope);
        debug!(scope = ?scope, removed, "Invalidated scope");
        removed
    }

    /// Every kind cached for `subject`, e.g. on logout.
    pub fn invalidate_subject(&self, subject: &SubjectId) -> usize {
        self.invalidate_scope(&KeyScope::Subject(subject.clone()))
    }

    /// One kind for `subject`, every discriminator.
    pub fn invalidate_kind(&self, subject: &SubjectId, kind: EntityKind) -> usize {
        self.invalidate_scope(&KeyScope::Kind(subject.clone(), kind))
    }

    pub fn invalidate_all(&self) -> usize {
        let removed = self.store.clear(None);
        debug!(removed, "Invalidated everything");
        removed
    }

    /// Drop `key` and fetch it again at once.
    ///
    /// A fetch already in flight for the key read before this call, so the
    /// refetch is queued behind it rather than joining it. The returned
    /// future resolves with a value read after the invalidation.
    pub fn invalidate_and_refetch<F, Fut>(
        &self,
        key: &EntityKey,
        ttl: TtlRule<V>,
        producer: F,
    ) -> FetchFuture<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = QalamResult<V>> + Send + 'static,
    {
        self.invalidate_and_refetch_debounced(key, ttl, producer, Duration::ZERO)
    }

    /// Drop `key` now and refetch once the key has been quiet for `debounce`.
    pub fn invalidate_and_refetch_debounced<F, Fut>(
        &self,
        key: &EntityKey,
        ttl: TtlRule<V>,
        producer: F,
        debounce: Duration,
    ) -> FetchFuture<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = QalamResult<V>> + Send + 'static,
    {
        let key = key.render();
        let removed = self.store.remove(&key);
        debug!(key = %key, removed, debounce_ms = debounce.as_millis() as u64, "Invalidating before refetch");
        self.coordinator.fetch_or_join(&key, ttl, producer, debounce)
    }
}
