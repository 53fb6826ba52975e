//! Usage counters.

use serde::Serialize;

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries currently held, including ones not yet evicted.
    pub entry_count: u64,
    /// Successful writes.
    pub sets: u64,
    /// Entries removed because they outlived their TTL or the read's max age.
    pub expirations: u64,
    /// Entries removed by explicit invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Statistics about fetch coordination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// Producer invocations.
    pub started: u64,
    /// Requests that joined a fetch already in flight.
    pub joined: u64,
    /// Requests folded into a running debounce window.
    pub coalesced: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Debounce windows cancelled before firing.
    pub cancelled: u64,
    /// Requests queued behind an in-flight fetch that an invalidation
    /// overtook.
    pub requeued: u64,
    /// Results not stored because their key was invalidated mid-fetch.
    pub discarded: u64,
}

impl FetchStats {
    /// Requests served without invoking a producer, per producer call.
    pub fn amplification(&self) -> f64 {
        if self.started == 0 {
            0.0
        } else {
            (self.joined + self.coalesced) as f64 / self.started as f64
        }
    }
}
