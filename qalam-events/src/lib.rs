//! QALAM Events - Change Notifications and Cross-Instance Signals
//!
//! Two small pieces of plumbing sit between the backend's push channels and
//! the cache instances:
//!
//! - [`ChangeEventBridge`] fans row-level change events out to topic
//!   subscriptions, absorbing duplicate deliveries.
//! - [`SignalBus`] lets one cache instance tell every other instance that a
//!   kind changed for a subject after a local mutation.
//!
//! ```text
//! backend stream ──► ChangeEventBridge ──► predicate ──► on_match (invalidate + refetch)
//! local mutation ──► SignalBus ──► other EntityCache instances
//! ```
//!
//! Neither piece retries or reorders; the transport owns reconnection and
//! events are handled independently as received.

mod bridge;
mod bus;

pub use bridge::{BridgeStats, ChangeEventBridge, OnMatch, Predicate, SubscriptionHandle};
pub use bus::{SignalBus, SignalReceiver};

// Re-export core types for convenience
pub use qalam_core::{CacheSignal, ChangeEvent, ChangeKind, Topic};
