//! QALAM Test Utilities
//!
//! Shared test infrastructure for the QALAM workspace:
//! - Tracing setup for tests
//! - Counting producers and a scriptable avatar backend
//! - Fixtures for common rows and change events
//! - Proptest generators for keys and kinds
//! - Assertions for QALAM error variants

// Re-export core types for convenience
pub use qalam_core::{
    AvatarBackend, AvatarProfile, AvatarRecord, AvatarSource, CacheConfig, CacheError,
    CacheSignal, ChangeEvent, ChangeKind, EntityKind, InventoryItem, LevelInfo, QalamError,
    QalamResult, Resolved, ShopItem, SourceError, SubjectId, Topic,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};

// ============================================================================
// TRACING
// ============================================================================

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("qalam=debug,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PRODUCERS
// ============================================================================

/// Producer that counts its invocations.
///
/// Each call returns the next value of a counter starting at 1, or a fetch
/// error while `fail` is set.
#[derive(Debug, Clone, Default)]
pub struct CountingProducer {
    calls: Arc<AtomicUsize>,
    fail: Arc<Mutex<Option<String>>>,
    delay: Duration,
}

impl CountingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each invocation takes `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail with `reason` until [`CountingProducer::recover`] is called.
    pub fn failing(self, reason: impl Into<String>) -> Self {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
        self
    }

    pub fn recover(&self) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, key: String) -> BoxFuture<'static, QalamResult<u64>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let fail = self.fail.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match fail {
                Some(reason) => Err(QalamError::fetch_failed(key, reason)),
                None => Ok(n),
            }
        }
        .boxed()
    }

    /// One-shot producer for a coordinator fetch of `key`.
    pub fn producer(&self, key: &str) -> impl FnOnce() -> BoxFuture<'static, QalamResult<u64>> + Send + 'static {
        let this = self.clone();
        let key = key.to_string();
        move || this.next(key)
    }

    /// Reusable refetch function, keyed by subject and kind.
    pub fn refetcher(
        &self,
    ) -> Arc<impl Fn(SubjectId, EntityKind) -> BoxFuture<'static, QalamResult<u64>> + Send + Sync + 'static> {
        let this = self.clone();
        Arc::new(move |subject: SubjectId, kind: EntityKind| this.next(format!("{}_{}", kind, subject)))
    }
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Avatar backend locations, for scripting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockSource {
    AvatarRecord,
    InventoryService,
    InventoryDirect,
    SignedUrl,
}

#[derive(Debug, Default)]
struct MockData {
    records: HashMap<SubjectId, AvatarRecord>,
    inventory: HashMap<SubjectId, Vec<InventoryItem>>,
    direct: HashMap<SubjectId, InventoryItem>,
    signed_urls: HashMap<String, String>,
    failing: HashSet<MockSource>,
    calls: HashMap<MockSource, usize>,
}

/// In-memory [`AvatarBackend`] with scriptable rows and outages.
#[derive(Debug, Clone, Default)]
pub struct MockAvatarBackend {
    data: Arc<Mutex<MockData>>,
}

impl MockAvatarBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut MockData) -> R) -> R {
        f(&mut self.data.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn with_record(self, subject: &SubjectId, record: AvatarRecord) -> Self {
        self.with_data(|d| d.records.insert(subject.clone(), record));
        self
    }

    pub fn with_inventory(self, subject: &SubjectId, items: Vec<InventoryItem>) -> Self {
        self.with_data(|d| d.inventory.insert(subject.clone(), items));
        self
    }

    pub fn with_direct(self, subject: &SubjectId, item: InventoryItem) -> Self {
        self.with_data(|d| d.direct.insert(subject.clone(), item));
        self
    }

    pub fn with_signed_url(self, path: impl Into<String>, url: impl Into<String>) -> Self {
        self.with_data(|d| d.signed_urls.insert(path.into(), url.into()));
        self
    }

    /// Make `source` fail until [`MockAvatarBackend::restore`].
    pub fn fail(&self, source: MockSource) {
        self.with_data(|d| d.failing.insert(source));
    }

    pub fn restore(&self, source: MockSource) {
        self.with_data(|d| d.failing.remove(&source));
    }

    /// Replace the subject's avatar record, as a local mutation would.
    pub fn set_record(&self, subject: &SubjectId, record: AvatarRecord) {
        self.with_data(|d| d.records.insert(subject.clone(), record));
    }

    pub fn calls(&self, source: MockSource) -> usize {
        self.with_data(|d| d.calls.get(&source).copied().unwrap_or(0))
    }

    pub fn total_calls(&self) -> usize {
        self.with_data(|d| d.calls.values().sum())
    }

    fn enter(&self, source: MockSource) -> QalamResult<()> {
        self.with_data(|d| {
            *d.calls.entry(source).or_default() += 1;
            if d.failing.contains(&source) {
                Err(QalamError::source_unavailable(format!("{:?}", source), "mock outage"))
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl AvatarBackend for MockAvatarBackend {
    async fn avatar_record(&self, subject: &SubjectId) -> QalamResult<Option<AvatarRecord>> {
        self.enter(MockSource::AvatarRecord)?;
        Ok(self.with_data(|d| d.records.get(subject).cloned()))
    }

    async fn inventory_via_service(&self, subject: &SubjectId) -> QalamResult<Vec<InventoryItem>> {
        self.enter(MockSource::InventoryService)?;
        Ok(self.with_data(|d| d.inventory.get(subject).cloned().unwrap_or_default()))
    }

    async fn equipped_avatar_direct(&self, subject: &SubjectId) -> QalamResult<Option<InventoryItem>> {
        self.enter(MockSource::InventoryDirect)?;
        Ok(self.with_data(|d| d.direct.get(subject).cloned()))
    }

    async fn create_signed_url(&self, path: &str, _expires_in: Duration) -> QalamResult<Option<String>> {
        self.enter(MockSource::SignedUrl)?;
        Ok(self.with_data(|d| d.signed_urls.get(path).cloned()))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made rows and events.

    use super::*;
    use serde_json::json;

    /// Subject id from a literal known to be valid.
    pub fn subject(id: &str) -> SubjectId {
        SubjectId::new(id).unwrap_or_else(|e| panic!("fixture subject {:?}: {}", id, e))
    }

    /// A signed URL long enough to pass the plausibility check.
    pub fn signed_url(path: &str) -> String {
        format!(
            "https://cdn.qalam.test/storage/v1/object/sign/{}?token=fixture-token-0123456789",
            path
        )
    }

    pub fn avatar_record(id: &str, url: impl Into<String>) -> AvatarRecord {
        AvatarRecord {
            id: id.to_string(),
            avatar: url.into(),
        }
    }

    pub fn shop_item(id: &str, name: &str) -> ShopItem {
        ShopItem {
            id: id.to_string(),
            name: name.to_string(),
            image: format!("https://cdn.qalam.test/shop/{}.png", id),
            thumbnail: Some(format!("https://cdn.qalam.test/shop/{}-thumb.png", id)),
        }
    }

    pub fn avatar_item(id: &str, equipped: bool) -> InventoryItem {
        InventoryItem {
            id: format!("inv-{}", id),
            item_type: "avatar".to_string(),
            is_equipped: equipped,
            shop_item: Some(shop_item(id, &format!("Avatar {}", id))),
        }
    }

    pub fn level(level: u32, xp: u64) -> LevelInfo {
        LevelInfo {
            level,
            description: format!("Level {}", level),
            xp,
        }
    }

    /// Inventory update that equips an avatar item.
    pub fn avatar_equipped_event(subject: &SubjectId) -> ChangeEvent {
        ChangeEvent::new(Topic::new("user_inventory"), ChangeKind::Update, subject.clone())
            .with_new(json!({"user_id": subject.as_str(), "item_type": "avatar", "is_equipped": true}))
            .with_old(json!({"user_id": subject.as_str(), "item_type": "avatar", "is_equipped": false}))
    }

    /// Inventory update that unequips an avatar item.
    pub fn avatar_unequipped_event(subject: &SubjectId) -> ChangeEvent {
        ChangeEvent::new(Topic::new("user_inventory"), ChangeKind::Update, subject.clone())
            .with_new(json!({"user_id": subject.as_str(), "item_type": "avatar", "is_equipped": false}))
            .with_old(json!({"user_id": subject.as_str(), "item_type": "avatar", "is_equipped": true}))
    }

    /// Inventory update that does not involve avatars.
    pub fn other_item_event(subject: &SubjectId) -> ChangeEvent {
        ChangeEvent::new(Topic::new("user_inventory"), ChangeKind::Update, subject.clone())
            .with_new(json!({"user_id": subject.as_str(), "item_type": "frame", "is_equipped": true}))
    }

    pub fn avatar_row_event(subject: &SubjectId, url: &str) -> ChangeEvent {
        ChangeEvent::new(Topic::new("avatars"), ChangeKind::Update, subject.clone())
            .with_new(json!({"user_id": subject.as_str(), "avatar": url}))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for QALAM identity and key types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a valid subject id, possibly containing `_` and `-`.
    pub fn arb_subject_id() -> impl Strategy<Value = SubjectId> {
        prop_oneof![
            "[a-zA-Z0-9_-]{1,24}",
            any::<[u8; 16]>().prop_map(|b| Uuid::from_bytes(b).to_string()),
        ]
        .prop_filter_map("valid subject", |s| SubjectId::new(s).ok())
    }

    pub fn arb_entity_kind() -> impl Strategy<Value = EntityKind> {
        prop::sample::select(EntityKind::ALL.to_vec())
    }

    /// Discriminators are non-empty and may contain further `:` segments.
    pub fn arb_discriminator() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}(:[a-z0-9]{1,8}){0,2}"
    }

    pub fn arb_key_parts() -> impl Strategy<Value = (SubjectId, EntityKind, Option<String>)> {
        (arb_subject_id(), arb_entity_kind(), proptest::option::of(arb_discriminator()))
    }

    /// TTLs between one millisecond and one hour.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..3_600_000).prop_map(Duration::from_millis)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for QALAM error variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &QalamResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &QalamResult<T>) {
        match result {
            Err(QalamError::Cache(CacheError::FetchFailed { .. })) => {}
            other => panic!("Expected FetchFailed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_timed_out<T: std::fmt::Debug>(result: &QalamResult<T>) {
        match result {
            Err(QalamError::Cache(CacheError::Timeout { .. })) => {}
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_source_unavailable<T: std::fmt::Debug>(result: &QalamResult<T>) {
        match result {
            Err(QalamError::Source(SourceError::Unavailable { .. })) => {}
            other => panic!("Expected source Unavailable, got: {:?}", other),
        }
    }

    /// Assert a resolved value came from `source`.
    #[track_caller]
    pub fn assert_resolved_from<V: std::fmt::Debug>(resolved: &Resolved<V>, source: &str) {
        assert_eq!(
            resolved.source(),
            Some(source),
            "Expected value from {}, got: {:?}",
            source,
            resolved
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
