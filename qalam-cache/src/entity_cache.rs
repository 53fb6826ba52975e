//! Per-concern cache facade.
//!
//! An [`EntityCache`] is an explicitly constructed service owning one store,
//! one fetch coordinator and one invalidation router. Several instances can
//! coexist (one per panel or concern); they keep each other fresh through a
//! [`SignalBus`] and react to backend changes through a
//! [`ChangeEventBridge`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use qalam_core::{
    CacheConfig, CacheSignal, ChangeEvent, EntityKind, LevelInfo, QalamResult, Resolved,
    SubjectId, Topic,
};
use qalam_events::{ChangeEventBridge, SignalBus, SubscriptionHandle};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::coordinator::FetchCoordinator;
use crate::freshness::CacheRead;
use crate::invalidation::InvalidationRouter;
use crate::keyspace::{EntityKey, KeyspacePolicy, TtlRule};
use crate::resolver::SourceFallbackResolver;
use crate::stats::{CacheStats, FetchStats};
use crate::ttl_store::TtlStore;

/// Loads the current value of `kind` for a subject from the backend.
#[async_trait]
pub trait Refetcher<V>: Send + Sync {
    async fn fetch(&self, subject: &SubjectId, kind: EntityKind) -> QalamResult<V>;
}

#[async_trait]
impl<V, F, Fut> Refetcher<V> for F
where
    F: Fn(SubjectId, EntityKind) -> Fut + Send + Sync,
    Fut: Future<Output = QalamResult<V>> + Send + 'static,
    V: Send + 'static,
{
    async fn fetch(&self, subject: &SubjectId, kind: EntityKind) -> QalamResult<V> {
        (self)(subject.clone(), kind).await
    }
}

/// Refetches through a [`SourceFallbackResolver`].
///
/// Absence is a value and gets cached. A full outage, where every source
/// failed, is an error and is not.
pub struct ResolverRefetcher<V> {
    resolver: SourceFallbackResolver<V>,
}

impl<V> ResolverRefetcher<V> {
    pub fn new(resolver: SourceFallbackResolver<V>) -> Self {
        Self { resolver }
    }
}

impl<V> From<SourceFallbackResolver<V>> for ResolverRefetcher<V> {
    fn from(resolver: SourceFallbackResolver<V>) -> Self {
        Self::new(resolver)
    }
}

#[async_trait]
impl<V> Refetcher<Resolved<V>> for ResolverRefetcher<V>
where
    V: Send + Sync + 'static,
{
    async fn fetch(&self, subject: &SubjectId, kind: EntityKind) -> QalamResult<Resolved<V>> {
        self.resolver.try_resolve(subject, kind).await
    }
}

fn producer<V, R>(
    refetcher: Arc<R>,
    subject: SubjectId,
    kind: EntityKind,
) -> impl FnOnce() -> BoxFuture<'static, QalamResult<V>> + Send + 'static
where
    V: Send + 'static,
    R: Refetcher<V> + ?Sized + 'static,
{
    move || async move { refetcher.fetch(&subject, kind).await }.boxed()
}

/// Cache for one concern, e.g. the avatar panel or the profile header.
pub struct EntityCache<V> {
    instance_id: Uuid,
    policy: KeyspacePolicy,
    store: TtlStore<V>,
    coordinator: FetchCoordinator<V>,
    router: InvalidationRouter<V>,
    ttl_rules: Arc<HashMap<EntityKind, TtlRule<V>>>,
    refetch_debounce: Duration,
}

impl<V> Clone for EntityCache<V> {
    fn clone(&self) -> Self {
        Self {
            instance_id: self.instance_id,
            policy: self.policy.clone(),
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            router: self.router.clone(),
            ttl_rules: Arc::clone(&self.ttl_rules),
            refetch_debounce: self.refetch_debounce,
        }
    }
}

impl<V> EntityCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        let store = TtlStore::from_config(config);
        let coordinator = FetchCoordinator::new(store.clone(), config.fetch.clone());
        let router = InvalidationRouter::new(coordinator.clone());
        Self {
            instance_id: Uuid::new_v4(),
            policy: KeyspacePolicy::from_config(config),
            store,
            coordinator,
            router,
            ttl_rules: Arc::new(HashMap::new()),
            refetch_debounce: config.refetch_debounce,
        }
    }

    /// Override the TTL rule for one kind.
    pub fn with_ttl_rule(mut self, kind: EntityKind, rule: TtlRule<V>) -> Self {
        let mut rules = HashMap::clone(&self.ttl_rules);
        rules.insert(kind, rule);
        self.ttl_rules = Arc::new(rules);
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn policy(&self) -> &KeyspacePolicy {
        &self.policy
    }

    pub fn store(&self) -> &TtlStore<V> {
        &self.store
    }

    pub fn coordinator(&self) -> &FetchCoordinator<V> {
        &self.coordinator
    }

    pub fn router(&self) -> &InvalidationRouter<V> {
        &self.router
    }

    pub fn key(&self, subject: &SubjectId, kind: EntityKind) -> EntityKey {
        self.policy.key(subject, kind).0
    }

    /// TTL rule used when caching `kind`.
    pub fn rule(&self, kind: EntityKind) -> TtlRule<V> {
        self.ttl_rules
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.policy.rule(kind))
    }

    /// Cached value, if still within the TTL it was stored with.
    pub fn peek(&self, subject: &SubjectId, kind: EntityKind) -> Option<V> {
        self.store.peek(&self.key(subject, kind).render())
    }

    /// Cached value with age metadata.
    pub fn read(&self, subject: &SubjectId, kind: EntityKind) -> Option<CacheRead<V>> {
        self.store
            .get_read(&self.key(subject, kind).render(), Duration::MAX)
    }

    /// Cached value, or a single coordinated fetch on miss.
    pub async fn get_or_fetch<R>(
        &self,
        subject: &SubjectId,
        kind: EntityKind,
        refetcher: Arc<R>,
    ) -> QalamResult<V>
    where
        R: Refetcher<V> + ?Sized + 'static,
    {
        self.get_or_fetch_debounced(subject, kind, refetcher, Duration::ZERO)
            .await
    }

    /// Like [`EntityCache::get_or_fetch`], collapsing bursts of misses into
    /// one fetch after `debounce` of quiet.
    pub async fn get_or_fetch_debounced<R>(
        &self,
        subject: &SubjectId,
        kind: EntityKind,
        refetcher: Arc<R>,
        debounce: Duration,
    ) -> QalamResult<V>
    where
        R: Refetcher<V> + ?Sized + 'static,
    {
        let key = self.key(subject, kind).render();
        if let Some(value) = self.store.peek(&key) {
            return Ok(value);
        }
        self.coordinator
            .fetch_or_join(
                &key,
                self.rule(kind),
                producer(refetcher, subject.clone(), kind),
                debounce,
            )
            .await
    }

    /// Replace the cached value with a fresh fetch.
    pub async fn refresh<R>(
        &self,
        subject: &SubjectId,
        kind: EntityKind,
        refetcher: Arc<R>,
    ) -> QalamResult<V>
    where
        R: Refetcher<V> + ?Sized + 'static,
    {
        let key = self.key(subject, kind);
        self.router
            .invalidate_and_refetch(
                &key,
                self.rule(kind),
                producer(refetcher, subject.clone(), kind),
            )
            .await
    }

    /// Drop everything cached for `subject`, e.g. on logout.
    pub fn invalidate_subject(&self, subject: &SubjectId) -> usize {
        self.router.invalidate_subject(subject)
    }

    pub fn invalidate_kind(&self, subject: &SubjectId, kind: EntityKind) -> usize {
        self.router.invalidate_kind(subject, kind)
    }

    /// After a local mutation: invalidate here and tell every other
    /// instance. Returns how many listeners were reached.
    pub fn notify_local_mutation(&self, subject: &SubjectId, kind: EntityKind, bus: &SignalBus) -> usize {
        self.invalidate_kind(subject, kind);
        bus.emit(CacheSignal::new(self.instance_id, subject.clone(), kind))
    }

    /// Invalidate and refetch on signals from other instances for any of
    /// `kinds`. Signals this instance emitted are ignored.
    ///
    /// The listener runs until the returned task is aborted or the bus is
    /// gone. Must be called from within a tokio runtime.
    pub fn listen<R>(&self, bus: &SignalBus, kinds: &[EntityKind], refetcher: Arc<R>) -> JoinHandle<()>
    where
        R: Refetcher<V> + ?Sized + 'static,
    {
        let cache = self.clone();
        let kinds = kinds.to_vec();
        let mut signals = bus.subscribe();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if signal.origin == cache.instance_id {
                    trace!(subject = %signal.subject_id, kind = %signal.kind, "Ignoring own signal");
                    continue;
                }
                if !kinds.contains(&signal.kind) {
                    continue;
                }
                debug!(
                    subject = %signal.subject_id,
                    kind = %signal.kind,
                    origin = %signal.origin,
                    "Signal received, refetching"
                );
                cache.refetch_in_background(signal.subject_id, signal.kind, Arc::clone(&refetcher));
            }
            debug!(instance = %cache.instance_id, "Signal bus closed, listener stopped");
        })
    }

    /// Invalidate and refetch `kind` whenever an event on `topic` passes
    /// `predicate`. Dropping the handle stops the watch.
    pub fn watch_changes<P, R>(
        &self,
        bridge: &ChangeEventBridge,
        topic: impl Into<Topic>,
        predicate: P,
        kind: EntityKind,
        refetcher: Arc<R>,
    ) -> SubscriptionHandle
    where
        P: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
        R: Refetcher<V> + ?Sized + 'static,
    {
        let cache = self.clone();
        bridge.subscribe(topic, predicate, move |event: &ChangeEvent| {
            debug!(
                topic = %event.topic,
                subject = %event.subject_id,
                kind = %kind,
                "Change matched, refetching"
            );
            cache.refetch_in_background(event.subject_id.clone(), kind, Arc::clone(&refetcher));
        })
    }

    /// Invalidate now, refetch after the change debounce on a background
    /// task. Without a runtime only the invalidation happens.
    fn refetch_in_background<R>(&self, subject: SubjectId, kind: EntityKind, refetcher: Arc<R>) -> bool
    where
        R: Refetcher<V> + ?Sized + 'static,
    {
        let key = self.key(&subject, kind);
        let Ok(runtime) = Handle::try_current() else {
            self.store.remove(&key.render());
            debug!(key = %key, "No async runtime, invalidated without refetch");
            return false;
        };

        let fetch = self.router.invalidate_and_refetch_debounced(
            &key,
            self.rule(kind),
            producer(refetcher, subject, kind),
            self.refetch_debounce,
        );
        runtime.spawn(async move {
            if let Err(e) = fetch.await {
                warn!(key = %key, error = %e, "Change-driven refetch failed");
            }
        });
        true
    }

    pub fn store_stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.coordinator.stats()
    }
}

impl EntityCache<LevelInfo> {
    /// Cache for levels. Unearned levels are rechecked after the shorter
    /// TTL from [`KeyspacePolicy::level_ttl_rule`].
    pub fn for_levels(config: &CacheConfig) -> Self {
        let cache = Self::new(config);
        let rule = cache.policy.level_ttl_rule();
        cache.with_ttl_rule(EntityKind::Level, rule)
    }
}
