//! Topic subscriptions over the change-notification stream.

use futures_util::{Stream, StreamExt};
use qalam_core::{CacheConfig, ChangeEvent, Topic};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// Filters the events a subscription cares about.
pub type Predicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Reaction to a matching event, typically invalidate-and-refetch.
pub type OnMatch = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Subscription {
    id: u64,
    predicate: Predicate,
    on_match: OnMatch,
}

/// Recently seen transport ids, oldest first.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record an id. Returns false if it is already in the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
        true
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Events accepted for delivery (duplicates excluded).
    pub delivered: u64,
    /// Callback invocations.
    pub matched: u64,
    /// Redeliveries of an already seen transport id.
    pub duplicates: u64,
    /// Live subscriptions.
    pub subscriptions: u64,
}

struct BridgeInner {
    subscriptions: RwLock<HashMap<Topic, Vec<Subscription>>>,
    dedup: Mutex<DedupWindow>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    matched: AtomicU64,
    duplicates: AtomicU64,
}

impl BridgeInner {
    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscriptions.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(topic);
        }
        removed
    }
}

/// Routes change events to the subscriptions registered for their topic.
///
/// An event published on `table` reaches subscriptions on `table` and on the
/// subject-filtered topic `table:<subject>`. Delivery is at-least-once
/// upstream: events carrying a transport id are remembered and a redelivery
/// of the same id is dropped before any callback runs. Events without an id
/// always pass, since equal content may be a genuine repeat (A, B, A).
/// Callbacks run outside every internal lock and may subscribe or
/// unsubscribe freely.
#[derive(Clone)]
pub struct ChangeEventBridge {
    inner: Arc<BridgeInner>,
}

impl ChangeEventBridge {
    /// Create a bridge remembering the last `dedup_window` transport ids.
    pub fn new(dedup_window: usize) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                subscriptions: RwLock::new(HashMap::new()),
                dedup: Mutex::new(DedupWindow::new(dedup_window)),
                next_id: AtomicU64::new(1),
                delivered: AtomicU64::new(0),
                matched: AtomicU64::new(0),
                duplicates: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.dedup_window)
    }

    /// Register interest in `topic`.
    ///
    /// The subscription lives until the returned handle is unsubscribed or
    /// dropped.
    pub fn subscribe<P, F>(&self, topic: impl Into<Topic>, predicate: P, on_match: F) -> SubscriptionHandle
    where
        P: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push(Subscription {
                id,
                predicate: Arc::new(predicate),
                on_match: Arc::new(on_match),
            });
        debug!(topic = %topic, subscription = id, "Subscribed to change events");

        SubscriptionHandle {
            topic,
            id,
            bridge: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver one event. Returns how many callbacks ran.
    pub fn deliver(&self, event: &ChangeEvent) -> usize {
        let fresh = match event.event_id {
            Some(id) => self
                .inner
                .dedup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id),
            None => true,
        };
        if !fresh {
            self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %event.topic, subject = %event.subject_id, "Duplicate change event absorbed");
            return 0;
        }
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);

        let candidates: Vec<(Predicate, OnMatch)> = {
            let subscriptions = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let filtered = Topic::for_subject(event.topic.as_str(), &event.subject_id);
            [&event.topic, &filtered]
                .into_iter()
                .filter_map(|topic| subscriptions.get(topic))
                .flatten()
                .map(|s| (Arc::clone(&s.predicate), Arc::clone(&s.on_match)))
                .collect()
        };

        let mut matched = 0;
        for (predicate, on_match) in candidates {
            if predicate(event) {
                on_match(event);
                matched += 1;
            }
        }
        self.inner.matched.fetch_add(matched as u64, Ordering::Relaxed);
        trace!(topic = %event.topic, kind = ?event.kind, matched, "Delivered change event");
        matched
    }

    /// Forward every event of `stream` into the bridge on a spawned task.
    ///
    /// The task ends with the stream and yields the number of events read.
    /// Must be called from within a tokio runtime.
    pub fn pump<S>(&self, stream: S) -> JoinHandle<u64>
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            let mut read = 0u64;
            while let Some(event) = stream.next().await {
                read += 1;
                bridge.deliver(&event);
            }
            debug!(events = read, "Change event stream ended");
            read
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            matched: self.inner.matched.load(Ordering::Relaxed),
            duplicates: self.inner.duplicates.load(Ordering::Relaxed),
            subscriptions: self.subscription_count() as u64,
        }
    }
}

impl Default for ChangeEventBridge {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Owner of one subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
    bridge: Weak<BridgeInner>,
    active: AtomicBool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the subscription. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bridge) = self.bridge.upgrade() {
            if bridge.remove(&self.topic, self.id) {
                debug!(topic = %self.topic, subscription = self.id, "Unsubscribed from change events");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qalam_core::{ChangeKind, SubjectId};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn inventory_event(subject: &str, item_type: &str) -> ChangeEvent {
        ChangeEvent::new(
            "user_inventory".into(),
            ChangeKind::Update,
            SubjectId::new(subject).unwrap(),
        )
        .with_id(Uuid::now_v7())
        .with_new(json!({ "item_type": item_type, "is_equipped": true }))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &ChangeEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_predicate_filters_events() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let _handle = bridge.subscribe(
            "user_inventory",
            |e: &ChangeEvent| e.touches("item_type", &json!("avatar")),
            on_match,
        );

        assert_eq!(bridge.deliver(&inventory_event("u1", "avatar")), 1);
        assert_eq!(bridge.deliver(&inventory_event("u1", "badge")), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subject_filtered_topic() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let subject = SubjectId::new("u1").unwrap();
        let _handle = bridge.subscribe(
            Topic::for_subject("user_inventory", &subject),
            |_: &ChangeEvent| true,
            on_match,
        );

        bridge.deliver(&inventory_event("u1", "avatar"));
        bridge.deliver(&inventory_event("u2", "avatar"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_delivery_is_absorbed() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let _handle = bridge.subscribe("user_inventory", |_: &ChangeEvent| true, on_match);

        let event = inventory_event("u1", "avatar");
        assert_eq!(bridge.deliver(&event), 1);
        assert_eq!(bridge.deliver(&event), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stats = bridge.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.matched, 1);
    }

    #[test]
    fn test_dedup_window_forgets_oldest() {
        let bridge = ChangeEventBridge::new(2);
        let first = inventory_event("u1", "avatar");
        bridge.deliver(&first);
        bridge.deliver(&inventory_event("u1", "avatar"));
        bridge.deliver(&inventory_event("u1", "avatar"));
        // `first` has left the window, so it counts as a new event again.
        bridge.deliver(&first);
        assert_eq!(bridge.stats().duplicates, 0);
        assert_eq!(bridge.stats().delivered, 4);
    }

    fn equip_event(equipped: bool) -> ChangeEvent {
        ChangeEvent::new(
            "user_inventory".into(),
            ChangeKind::Update,
            SubjectId::new("u1").unwrap(),
        )
        .with_new(json!({ "item_type": "avatar", "is_equipped": equipped }))
        .with_old(json!({ "item_type": "avatar", "is_equipped": !equipped }))
    }

    #[test]
    fn test_repeated_change_without_id_is_delivered() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let _handle = bridge.subscribe("user_inventory", |_: &ChangeEvent| true, on_match);

        // equip, unequip, equip again: the third event equals the first.
        assert_eq!(bridge.deliver(&equip_event(true)), 1);
        assert_eq!(bridge.deliver(&equip_event(false)), 1);
        assert_eq!(bridge.deliver(&equip_event(true)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let stats = bridge.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn test_equal_content_with_distinct_ids_is_delivered() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let _handle = bridge.subscribe("user_inventory", |_: &ChangeEvent| true, on_match);

        let first = equip_event(true).with_id(Uuid::now_v7());
        let second = equip_event(true).with_id(Uuid::now_v7());
        bridge.deliver(&first);
        bridge.deliver(&second);
        bridge.deliver(&first);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.stats().duplicates, 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let handle = bridge.subscribe("user_inventory", |_: &ChangeEvent| true, on_match);
        assert_eq!(bridge.subscription_count(), 1);

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());
        assert_eq!(bridge.subscription_count(), 0);

        bridge.deliver(&inventory_event("u1", "avatar"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bridge = ChangeEventBridge::new(16);
        {
            let _handle = bridge.subscribe("profiles", |_: &ChangeEvent| true, |_: &ChangeEvent| {});
            assert_eq!(bridge.subscription_count(), 1);
        }
        assert_eq!(bridge.subscription_count(), 0);
    }

    #[test]
    fn test_handle_outliving_bridge() {
        let bridge = ChangeEventBridge::new(16);
        let handle = bridge.subscribe("profiles", |_: &ChangeEvent| true, |_: &ChangeEvent| {});
        drop(bridge);
        handle.unsubscribe();
        assert!(!handle.is_active());
    }

    #[test]
    fn test_callback_may_subscribe() {
        let bridge = ChangeEventBridge::new(16);
        let inner = bridge.clone();
        let spawned: Arc<Mutex<Vec<SubscriptionHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&spawned);
        let _handle = bridge.subscribe("profiles", |_: &ChangeEvent| true, move |_: &ChangeEvent| {
            let handle = inner.subscribe("avatars", |_: &ChangeEvent| true, |_: &ChangeEvent| {});
            sink.lock().unwrap().push(handle);
        });

        let event = ChangeEvent::new(
            "profiles".into(),
            ChangeKind::Update,
            SubjectId::new("u1").unwrap(),
        );
        bridge.deliver(&event);
        assert_eq!(bridge.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_pump_forwards_stream() {
        let bridge = ChangeEventBridge::new(16);
        let (count, on_match) = counter();
        let _handle = bridge.subscribe("user_inventory", |_: &ChangeEvent| true, on_match);

        let events = vec![
            inventory_event("u1", "avatar"),
            inventory_event("u2", "avatar"),
            inventory_event("u3", "badge"),
        ];
        let read = bridge
            .pump(futures_util::stream::iter(events))
            .await
            .unwrap();

        assert_eq!(read, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
