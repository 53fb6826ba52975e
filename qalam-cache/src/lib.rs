//! QALAM Cache - Entity Cache Engine
//!
//! Keeps per-subject entity data (avatar, badge, profile, level,
//! notifications, rating eligibility) fresh without hammering the backend.
//!
//! # Layers
//!
//! - [`TtlStore`]: key/value entries with per-entry TTL and expiry timers
//! - [`KeyspacePolicy`]: `(subject, kind)` to key and TTL
//! - [`FetchCoordinator`]: at most one fetch per key, debounce and backoff
//! - [`InvalidationRouter`]: bulk invalidation, invalidate-then-refetch
//! - [`SourceFallbackResolver`]: ordered fallback across backend sources
//! - [`EntityCache`]: the per-concern facade tying them together
//!
//! Change notifications reach the cache through
//! [`qalam_events::ChangeEventBridge`]; instances tell each other about
//! local mutations through [`qalam_events::SignalBus`].

mod avatar;
mod coordinator;
mod entity_cache;
mod freshness;
mod invalidation;
mod keyspace;
mod resolver;
mod scheduler;
mod stats;
mod ttl_store;

pub use avatar::{
    avatar_resolver, inventory_avatar_changed, AvatarRecordProbe, InventoryDirectProbe,
    InventoryServiceProbe, SignedUrlRepair, AVATAR_TABLE, INVENTORY_TABLE,
};
pub use coordinator::{FetchCoordinator, FetchFuture};
pub use entity_cache::{EntityCache, Refetcher, ResolverRefetcher};
pub use freshness::CacheRead;
pub use invalidation::InvalidationRouter;
pub use keyspace::{EntityKey, KeyScope, KeyspacePolicy, TtlRule};
pub use resolver::{SourceFallbackResolver, SourceProbe, ValueRepair};
pub use scheduler::{Job, ScheduledTask, Scheduler, TokioScheduler};
pub use stats::{CacheStats, FetchStats};
pub use ttl_store::{ExpiryCause, StoreEvent, TtlStore, WriteClaim};

pub use qalam_core::{
    AvatarProfile, CacheConfig, EntityKind, LevelInfo, QalamError, QalamResult, Resolved,
    SubjectId,
};
