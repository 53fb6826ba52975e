//! End-to-end cache scenarios on a paused clock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use qalam_cache::{
    avatar_resolver, inventory_avatar_changed, EntityCache, ExpiryCause, FetchCoordinator,
    ResolverRefetcher, StoreEvent, TtlRule, TtlStore, INVENTORY_TABLE,
};
use qalam_core::{
    AvatarBackend, AvatarProfile, CacheConfig, EntityKind, FetchConfig, LevelInfo, QalamError,
    QalamResult, Resolved, SubjectId,
};
use qalam_events::{ChangeEventBridge, SignalBus};
use qalam_test_utils::{assertions, fixtures, init_test_tracing, CountingProducer, MockAvatarBackend, MockSource};
use tokio::time::Instant;
use uuid::Uuid;

const MINUTE: Duration = Duration::from_secs(60);

fn avatar_cache(
    config: &CacheConfig,
    backend: &MockAvatarBackend,
) -> (EntityCache<Resolved<AvatarProfile>>, Arc<ResolverRefetcher<AvatarProfile>>) {
    let backend: Arc<dyn AvatarBackend> = Arc::new(backend.clone());
    (
        EntityCache::new(config),
        Arc::new(ResolverRefetcher::new(avatar_resolver(backend))),
    )
}

/// Refetcher that reads `state` when called and answers after `latency`.
fn backend_state(
    state: &Arc<AtomicU64>,
    latency: Duration,
) -> Arc<impl Fn(SubjectId, EntityKind) -> BoxFuture<'static, QalamResult<u64>> + Send + Sync + 'static> {
    let state = Arc::clone(state);
    Arc::new(move |_subject: SubjectId, _kind: EntityKind| {
        let value = state.load(Ordering::SeqCst);
        async move {
            tokio::time::sleep(latency).await;
            Ok(value)
        }
        .boxed()
    })
}

// ============================================================================
// STORE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_entry_fresh_until_ttl_then_gone() {
    init_test_tracing();
    let store: TtlStore<&str> = TtlStore::new(Duration::from_secs(300));
    store.set("badge_u1", "gold", MINUTE);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(store.peek("badge_u1"), Some("gold"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.peek("badge_u1"), None);
    assert_eq!(store.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overwrite_leaves_one_live_timer() {
    let store: TtlStore<u32> = TtlStore::new(Duration::from_secs(300));
    let mut events = store.subscribe();

    store.set("avatar_u1", 1, Duration::from_secs(10));
    tokio::time::sleep(Duration::from_secs(5)).await;
    store.set("avatar_u1", 2, Duration::from_secs(10));

    // The first write's timer would have fired at t=10s.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(store.peek("avatar_u1"), Some(2));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!store.has("avatar_u1"));

    let mut expired = Vec::new();
    while let Ok(event) = events.try_recv() {
        expired.push(event);
    }
    assert_eq!(
        expired,
        vec![StoreEvent::Expired {
            key: "avatar_u1".to_string(),
            cause: ExpiryCause::Timer,
        }]
    );
    assert_eq!(store.stats().expirations, 1);
}

// ============================================================================
// FETCH COORDINATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_fetch() {
    let store: TtlStore<u64> = TtlStore::new(Duration::from_secs(300));
    let coordinator = FetchCoordinator::new(store.clone(), FetchConfig::default());
    let producer = CountingProducer::new().with_delay(Duration::from_millis(100));

    let requests = (0..10).map(|_| {
        coordinator.fetch_or_join("profile_u1", TtlRule::Fixed(MINUTE), producer.producer("profile_u1"), Duration::ZERO)
    });
    let results = join_all(requests).await;

    assert!(results.iter().all(|r| *r == Ok(1)));
    assert_eq!(producer.calls(), 1);
    assert_eq!(store.peek("profile_u1"), Some(1));
    assert_eq!(coordinator.stats().joined, 9);
    assert!(!coordinator.is_pending("profile_u1"));
}

#[tokio::test(start_paused = true)]
async fn test_burst_fires_once_after_quiet_period() {
    let store: TtlStore<u64> = TtlStore::new(Duration::from_secs(300));
    let coordinator = FetchCoordinator::new(store.clone(), FetchConfig::default());
    let debounce = Duration::from_millis(3000);
    let start = Instant::now();

    let first = tokio::spawn(coordinator.fetch_or_join(
        "avatar_u1",
        TtlRule::Fixed(MINUTE),
        || async { Ok::<u64, QalamError>(0) },
        debounce,
    ));
    for i in 1..=4u64 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(coordinator.fetch_or_join(
            "avatar_u1",
            TtlRule::Fixed(MINUTE),
            move || async move { Ok::<u64, QalamError>(i) },
            debounce,
        ));
    }

    // Last request at t=2s, so the window closes at t=5s with its producer.
    let value = first.await.unwrap().unwrap();
    assert_eq!(value, 4);
    assert_eq!(start.elapsed(), Duration::from_millis(5000));

    let stats = coordinator.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.coalesced, 4);
    assert_eq!(store.peek("avatar_u1"), Some(4));
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_not_cached_and_next_request_retries() {
    let store: TtlStore<u64> = TtlStore::new(Duration::from_secs(300));
    let coordinator = FetchCoordinator::new(store.clone(), FetchConfig::default());
    let producer = CountingProducer::new().failing("connection reset");

    let result = coordinator
        .fetch_or_join("badge_u1", TtlRule::Fixed(MINUTE), producer.producer("badge_u1"), Duration::ZERO)
        .await;
    assertions::assert_fetch_failed(&result);
    assert!(!store.has("badge_u1"));
    assert_eq!(coordinator.failure_count("badge_u1"), 1);

    producer.recover();
    let result = coordinator
        .fetch_or_join("badge_u1", TtlRule::Fixed(MINUTE), producer.producer("badge_u1"), Duration::ZERO)
        .await;
    assert_eq!(result, Ok(2));
    assert_eq!(producer.calls(), 2);
    assert_eq!(coordinator.failure_count("badge_u1"), 0);
}

// ============================================================================
// ENTITY CACHE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unearned_level_rechecked_after_two_minutes() {
    let cache = EntityCache::for_levels(&CacheConfig::default());
    let u1 = fixtures::subject("u1");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let refetcher = Arc::new(move |_subject: SubjectId, _kind: EntityKind| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            Ok::<_, QalamError>(if n == 0 {
                LevelInfo::unearned()
            } else {
                fixtures::level(3, 500)
            })
        }
    });

    let level = cache.get_or_fetch(&u1, EntityKind::Level, Arc::clone(&refetcher)).await.unwrap();
    assert!(level.is_unearned());

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(cache.peek(&u1, EntityKind::Level), None);

    let level = cache.get_or_fetch(&u1, EntityKind::Level, refetcher).await.unwrap();
    assert_eq!(level.level, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.read(&u1, EntityKind::Level).unwrap().ttl(), Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_change_events_refetch_once() {
    let config = CacheConfig::default();
    let bridge = ChangeEventBridge::from_config(&config);
    let cache: EntityCache<u64> = EntityCache::new(&config);
    let u1 = fixtures::subject("u1");
    let producer = CountingProducer::new();

    let _watch = cache.watch_changes(
        &bridge,
        INVENTORY_TABLE,
        inventory_avatar_changed,
        EntityKind::Avatar,
        producer.refetcher(),
    );

    let event = fixtures::avatar_equipped_event(&u1).with_id(Uuid::new_v4());
    assert_eq!(bridge.deliver(&event), 1);
    assert_eq!(bridge.deliver(&event), 0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(producer.calls(), 1);
    assert_eq!(cache.peek(&u1, EntityKind::Avatar), Some(1));

    // Distinct deliveries close together collapse into one refetch.
    bridge.deliver(&fixtures::avatar_equipped_event(&u1).with_id(Uuid::new_v4()));
    bridge.deliver(&fixtures::avatar_equipped_event(&u1).with_id(Uuid::new_v4()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(producer.calls(), 2);
    assert_eq!(bridge.stats().duplicates, 1);
}

#[tokio::test(start_paused = true)]
async fn test_equip_unequip_equip_tracks_backend() {
    let config = CacheConfig::default();
    let bridge = ChangeEventBridge::from_config(&config);
    let cache: EntityCache<u64> = EntityCache::new(&config);
    let u1 = fixtures::subject("u1");
    let equipped = Arc::new(AtomicU64::new(0));

    let _watch = cache.watch_changes(
        &bridge,
        INVENTORY_TABLE,
        inventory_avatar_changed,
        EntityKind::Avatar,
        backend_state(&equipped, Duration::ZERO),
    );

    // The third notification carries the same content as the first.
    for (state, event) in [
        (1, fixtures::avatar_equipped_event(&u1)),
        (0, fixtures::avatar_unequipped_event(&u1)),
        (1, fixtures::avatar_equipped_event(&u1)),
    ] {
        equipped.store(state, Ordering::SeqCst);
        assert_eq!(bridge.deliver(&event), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.peek(&u1, EntityKind::Avatar), Some(state));
    }
    assert_eq!(bridge.stats().duplicates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_change_during_slow_fetch_is_not_lost() {
    let config = CacheConfig::default();
    let bridge = ChangeEventBridge::from_config(&config);
    let cache: EntityCache<u64> = EntityCache::new(&config);
    let u1 = fixtures::subject("u1");
    let backend = Arc::new(AtomicU64::new(1));
    let refetcher = backend_state(&backend, Duration::from_secs(2));

    let _watch = cache.watch_changes(
        &bridge,
        INVENTORY_TABLE,
        inventory_avatar_changed,
        EntityKind::Avatar,
        Arc::clone(&refetcher),
    );
    let first = tokio::spawn({
        let cache = cache.clone();
        let u1 = u1.clone();
        async move { cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    backend.store(2, Ordering::SeqCst);
    bridge.deliver(&fixtures::avatar_equipped_event(&u1).with_id(Uuid::new_v4()));

    // The caller that asked before the change still gets the earlier read.
    assert_eq!(first.await.unwrap().unwrap(), 1);
    tokio::time::sleep(MINUTE).await;
    assert_eq!(cache.peek(&u1, EntityKind::Avatar), Some(2));
    assert_eq!(cache.fetch_stats().discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_slow_fetch_caches_nothing() {
    let cache: EntityCache<u64> = EntityCache::new(&CacheConfig::default());
    let u1 = fixtures::subject("u1");
    let backend = Arc::new(AtomicU64::new(7));
    let refetcher = backend_state(&backend, Duration::from_secs(1));

    let fetch = tokio::spawn({
        let cache = cache.clone();
        let u1 = u1.clone();
        let refetcher = Arc::clone(&refetcher);
        async move { cache.get_or_fetch(&u1, EntityKind::Profile, refetcher).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.invalidate_subject(&u1);

    assert_eq!(fetch.await.unwrap().unwrap(), 7);
    assert_eq!(cache.peek(&u1, EntityKind::Profile), None);
    assert!(!cache.coordinator().is_pending("profile_u1"));

    // The next reader starts from scratch.
    backend.store(8, Ordering::SeqCst);
    assert_eq!(cache.get_or_fetch(&u1, EntityKind::Profile, refetcher).await.unwrap(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_inventory_change_keeps_value() {
    let config = CacheConfig::default();
    let bridge = ChangeEventBridge::from_config(&config);
    let cache: EntityCache<u64> = EntityCache::new(&config);
    let u1 = fixtures::subject("u1");
    let producer = CountingProducer::new();
    cache.store().set("avatar_u1", 42, Duration::from_secs(600));

    let _watch = cache.watch_changes(
        &bridge,
        INVENTORY_TABLE,
        inventory_avatar_changed,
        EntityKind::Avatar,
        producer.refetcher(),
    );
    assert_eq!(bridge.deliver(&fixtures::other_item_event(&u1)), 0);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(cache.peek(&u1, EntityKind::Avatar), Some(42));
    assert_eq!(producer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_logout_clears_only_that_subject() {
    let cache: EntityCache<u64> = EntityCache::new(&CacheConfig::default());
    let store = cache.store();
    store.set("avatar_u1", 1, MINUTE);
    store.set("level_u1", 2, MINUTE);
    store.set("notifications_u1:page:1", 3, MINUTE);
    store.set("avatar_u10", 4, MINUTE);

    assert_eq!(cache.invalidate_subject(&fixtures::subject("u1")), 3);
    assert_eq!(store.keys(), vec!["avatar_u10".to_string()]);
}

// ============================================================================
// AVATAR RESOLUTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_avatar_record_wins_over_inventory() {
    let u1 = fixtures::subject("u1");
    let url = fixtures::signed_url("profile/avatar/u1.webm");
    let backend = MockAvatarBackend::new()
        .with_record(&u1, fixtures::avatar_record("a1", url.clone()))
        .with_inventory(&u1, vec![fixtures::avatar_item("s1", true)]);
    let (cache, refetcher) = avatar_cache(&CacheConfig::default(), &backend);

    let resolved = cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assertions::assert_resolved_from(&resolved, "avatar-record");
    let avatar = resolved.value().unwrap();
    assert_eq!(avatar.image, url);
    assert!(avatar.is_video);
    assert_eq!(backend.calls(MockSource::InventoryService), 0);
}

#[tokio::test(start_paused = true)]
async fn test_avatar_falls_back_through_inventory_sources() {
    let u1 = fixtures::subject("u1");
    let backend = MockAvatarBackend::new()
        .with_inventory(&u1, vec![fixtures::avatar_item("s1", false)])
        .with_direct(&u1, fixtures::avatar_item("s2", true));
    backend.fail(MockSource::AvatarRecord);
    let (cache, refetcher) = avatar_cache(&CacheConfig::default(), &backend);

    let resolved = cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assertions::assert_resolved_from(&resolved, "inventory-direct");
    assert_eq!(resolved.value().unwrap().id, "s2");
    assert!(!resolved.value().unwrap().is_video);
}

#[tokio::test(start_paused = true)]
async fn test_truncated_avatar_url_is_re_signed() {
    let u1 = fixtures::subject("u1");
    let signed = fixtures::signed_url("profile/avatar/u1.webm");
    let backend = MockAvatarBackend::new()
        .with_record(&u1, fixtures::avatar_record("a1", "/profile/avatar/u1.webm"))
        .with_signed_url("profile/avatar/u1.webm", signed.clone());
    let (cache, refetcher) = avatar_cache(&CacheConfig::default(), &backend);

    let resolved = cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assertions::assert_resolved_from(&resolved, "avatar-record");
    assert_eq!(resolved.value().unwrap().image, signed);
    assert_eq!(backend.calls(MockSource::SignedUrl), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_avatar_anywhere_is_cached_as_absent() {
    let u1 = fixtures::subject("u1");
    let backend = MockAvatarBackend::new();
    let (cache, refetcher) = avatar_cache(&CacheConfig::default(), &backend);

    let resolved = cache.get_or_fetch(&u1, EntityKind::Avatar, Arc::clone(&refetcher)).await.unwrap();
    assert!(resolved.is_absent());
    let calls = backend.total_calls();

    let again = cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assert!(again.is_absent());
    assert_eq!(backend.total_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_total_outage_is_an_error_and_not_cached() {
    let u1 = fixtures::subject("u1");
    let backend = MockAvatarBackend::new().with_direct(&u1, fixtures::avatar_item("s2", true));
    backend.fail(MockSource::AvatarRecord);
    backend.fail(MockSource::InventoryService);
    backend.fail(MockSource::InventoryDirect);
    let (cache, refetcher) = avatar_cache(&CacheConfig::default(), &backend);

    let result = cache.get_or_fetch(&u1, EntityKind::Avatar, Arc::clone(&refetcher)).await;
    assertions::assert_source_unavailable(&result);
    assert_eq!(cache.peek(&u1, EntityKind::Avatar), None);

    backend.restore(MockSource::InventoryDirect);
    let resolved = cache.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assertions::assert_resolved_from(&resolved, "inventory-direct");
}

#[tokio::test(start_paused = true)]
async fn test_local_mutation_reaches_other_instance() {
    let config = CacheConfig::default();
    let bus = SignalBus::from_config(&config);
    let u1 = fixtures::subject("u1");
    let backend = MockAvatarBackend::new()
        .with_record(&u1, fixtures::avatar_record("a1", fixtures::signed_url("profile/avatar/u1-old.webm")));
    let (header, refetcher) = avatar_cache(&config, &backend);
    let (panel, _) = avatar_cache(&config, &backend);

    header.get_or_fetch(&u1, EntityKind::Avatar, Arc::clone(&refetcher)).await.unwrap();
    panel.get_or_fetch(&u1, EntityKind::Avatar, Arc::clone(&refetcher)).await.unwrap();
    let listener = header.listen(&bus, &[EntityKind::Avatar], Arc::clone(&refetcher));

    let new_url = fixtures::signed_url("profile/avatar/u1-new.webm");
    backend.set_record(&u1, fixtures::avatar_record("a1", new_url.clone()));
    assert_eq!(panel.notify_local_mutation(&u1, EntityKind::Avatar, &bus), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let header_avatar = header.peek(&u1, EntityKind::Avatar).and_then(Resolved::into_option);
    assert_eq!(header_avatar.map(|a| a.image), Some(new_url.clone()));

    let panel_avatar = panel.get_or_fetch(&u1, EntityKind::Avatar, refetcher).await.unwrap();
    assert_eq!(panel_avatar.value().map(|a| a.image.as_str()), Some(new_url.as_str()));
    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_surfaces_and_caches_nothing() {
    let fetch = FetchConfig {
        fetch_timeout: Some(Duration::from_secs(2)),
        ..FetchConfig::default()
    };
    let store: TtlStore<u64> = TtlStore::new(Duration::from_secs(300));
    let coordinator = FetchCoordinator::new(store.clone(), fetch);
    let slow = CountingProducer::new().with_delay(Duration::from_secs(5));

    let result: QalamResult<u64> = coordinator
        .fetch_or_join("profile_u1", TtlRule::Fixed(MINUTE), slow.producer("profile_u1"), Duration::ZERO)
        .await;
    assertions::assert_timed_out(&result);
    assert!(!store.has("profile_u1"));
}
