//! Freshness metadata for cache reads.

use std::time::Duration;
use tokio::time::Instant;

/// Result of a cache read, carrying age metadata.
///
/// Callers that only want the value use [`CacheRead::into_value`]; callers
/// that render "last updated" hints or decide on a background refresh can
/// inspect the age and the remaining lifetime.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    inserted_at: Instant,
    age: Duration,
    ttl: Duration,
}

impl<T> CacheRead<T> {
    pub(crate) fn new(value: T, inserted_at: Instant, age: Duration, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at,
            age,
            ttl,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// When the entry was written.
    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    /// Age of the entry at the time of the read.
    pub fn age(&self) -> Duration {
        self.age
    }

    /// The TTL the entry was written with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lifetime left at the time of the read.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.age)
    }

    /// True if the entry was at most `max_age` old when read.
    pub fn is_fresh_within(&self, max_age: Duration) -> bool {
        self.age <= max_age
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            inserted_at: self.inserted_at,
            age: self.age,
            ttl: self.ttl,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
