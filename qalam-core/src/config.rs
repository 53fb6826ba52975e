//! Configuration types
//!
//! Durations are expressed in milliseconds on the wire (TOML or environment)
//! and as [`Duration`] in code. Every section has defaults, so partial files
//! are accepted.

use crate::{ConfigError, EntityKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "QALAM_CACHE_";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

// ============================================================================
// PER-KIND TTL TABLE
// ============================================================================

/// Default time-to-live per entity kind.
///
/// Volatile, cheaply recomputed facts get short TTLs. Facts that change only
/// on explicit user action are also covered by change-driven invalidation,
/// so their TTL is a safety net.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindTtls {
    #[serde(with = "duration_ms")]
    pub avatar: Duration,
    #[serde(with = "duration_ms")]
    pub badge: Duration,
    #[serde(with = "duration_ms")]
    pub profile: Duration,
    #[serde(with = "duration_ms")]
    pub level: Duration,
    /// Used instead of `level` while the computed level is the unearned one.
    #[serde(with = "duration_ms")]
    pub level_unearned: Duration,
    #[serde(with = "duration_ms")]
    pub notifications: Duration,
    #[serde(with = "duration_ms")]
    pub rating_eligibility: Duration,
    #[serde(with = "duration_ms")]
    pub inventory: Duration,
}

impl Default for KindTtls {
    fn default() -> Self {
        Self {
            avatar: Duration::from_millis(600_000),
            badge: Duration::from_millis(600_000),
            profile: Duration::from_millis(300_000),
            level: Duration::from_millis(300_000),
            level_unearned: Duration::from_millis(120_000),
            notifications: Duration::from_millis(120_000),
            rating_eligibility: Duration::from_millis(60_000),
            inventory: Duration::from_millis(600_000),
        }
    }
}

impl KindTtls {
    /// TTL for a kind.
    pub fn ttl(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Avatar => self.avatar,
            EntityKind::Badge => self.badge,
            EntityKind::Profile => self.profile,
            EntityKind::Level => self.level,
            EntityKind::Notifications => self.notifications,
            EntityKind::RatingEligibility => self.rating_eligibility,
            EntityKind::Inventory => self.inventory,
        }
    }

    fn set(&mut self, kind: EntityKind, ttl: Duration) {
        match kind {
            EntityKind::Avatar => self.avatar = ttl,
            EntityKind::Badge => self.badge = ttl,
            EntityKind::Profile => self.profile = ttl,
            EntityKind::Level => self.level = ttl,
            EntityKind::Notifications => self.notifications = ttl,
            EntityKind::RatingEligibility => self.rating_eligibility = ttl,
            EntityKind::Inventory => self.inventory = ttl,
        }
    }

    fn entries(&self) -> Vec<(&'static str, Duration)> {
        let mut entries: Vec<_> = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str(), self.ttl(kind)))
            .collect();
        entries.push(("level-unearned", self.level_unearned));
        entries
    }
}

// ============================================================================
// FETCH COORDINATION
// ============================================================================

/// Backoff applied to repeated fetch failures for the same key.
///
/// The first retry after a failure is immediate. From the second consecutive
/// failure on, the next attempt waits `initial * multiplier^(n - 2)`,
/// capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub initial: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the next attempt after `consecutive_failures` failures.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if !self.enabled || consecutive_failures < 2 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 2).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Fetch coordination limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Upper bound on any single debounce window.
    #[serde(with = "duration_ms")]
    pub max_debounce_window: Duration,
    /// Upper bound between the first request of a burst and the fetch.
    #[serde(with = "duration_ms")]
    pub max_debounce_wait: Duration,
    /// Deadline imposed on producers. `None` leaves timeouts to the transport.
    #[serde(with = "option_duration_ms")]
    pub fetch_timeout: Option<Duration>,
    pub backoff: BackoffConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_debounce_window: Duration::from_millis(3_000),
            max_debounce_wait: Duration::from_millis(10_000),
            fetch_timeout: None,
            backoff: BackoffConfig::default(),
        }
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration for one cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness applied by `get` when the caller does not ask for less.
    #[serde(with = "duration_ms")]
    pub default_max_age: Duration,
    pub ttls: KindTtls,
    pub fetch: FetchConfig,
    /// Debounce used when a change notification triggers a refetch.
    #[serde(with = "duration_ms")]
    pub refetch_debounce: Duration,
    /// Number of recent transport event ids kept to absorb redeliveries.
    pub dedup_window: usize,
    /// Buffer size of the cross-instance signal bus.
    pub signal_capacity: usize,
    /// Buffer size of the store event channel.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_max_age: Duration::from_millis(300_000),
            ttls: KindTtls::default(),
            fetch: FetchConfig::default(),
            refetch_debounce: Duration::from_millis(300),
            dedup_window: 256,
            signal_capacity: 64,
            event_capacity: 128,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default max age for reads.
    pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    /// Override the TTL of one kind.
    pub fn with_ttl(mut self, kind: EntityKind, ttl: Duration) -> Self {
        self.ttls.set(kind, ttl);
        self
    }

    /// Set the fetch coordination limits.
    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.fetch.backoff = backoff;
        self
    }

    /// Set a producer deadline.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch.fetch_timeout = Some(timeout);
        self
    }

    /// Set the change-driven refetch debounce.
    pub fn with_refetch_debounce(mut self, debounce: Duration) -> Self {
        self.refetch_debounce = debounce;
        self
    }

    /// Set the duplicate-event window.
    pub fn with_dedup_window(mut self, size: usize) -> Self {
        self.dedup_window = size;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables (all optional, milliseconds unless noted):
    /// - `QALAM_CACHE_DEFAULT_MAX_AGE_MS`
    /// - `QALAM_CACHE_TTL_<KIND>_MS` where `<KIND>` is `AVATAR`, `BADGE`,
    ///   `PROFILE`, `LEVEL`, `NOTIFICATIONS`, `RATING_ELIGIBILITY`, `INVENTORY`
    /// - `QALAM_CACHE_TTL_LEVEL_UNEARNED_MS`
    /// - `QALAM_CACHE_MAX_DEBOUNCE_WINDOW_MS`, `QALAM_CACHE_MAX_DEBOUNCE_WAIT_MS`
    /// - `QALAM_CACHE_FETCH_TIMEOUT_MS` (unset = no timeout)
    /// - `QALAM_CACHE_BACKOFF_ENABLED` ("true"/"false"),
    ///   `QALAM_CACHE_BACKOFF_INITIAL_MS`, `QALAM_CACHE_BACKOFF_MAX_MS`
    /// - `QALAM_CACHE_REFETCH_DEBOUNCE_MS`
    /// - `QALAM_CACHE_DEDUP_WINDOW` (count)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(d) = env_ms("DEFAULT_MAX_AGE_MS") {
            config.default_max_age = d;
        }
        for kind in EntityKind::ALL {
            let name = format!(
                "TTL_{}_MS",
                kind.as_str().to_uppercase().replace('-', "_")
            );
            if let Some(d) = env_ms(&name) {
                config.ttls.set(kind, d);
            }
        }
        if let Some(d) = env_ms("TTL_LEVEL_UNEARNED_MS") {
            config.ttls.level_unearned = d;
        }
        if let Some(d) = env_ms("MAX_DEBOUNCE_WINDOW_MS") {
            config.fetch.max_debounce_window = d;
        }
        if let Some(d) = env_ms("MAX_DEBOUNCE_WAIT_MS") {
            config.fetch.max_debounce_wait = d;
        }
        if let Some(d) = env_ms("FETCH_TIMEOUT_MS") {
            config.fetch.fetch_timeout = Some(d);
        }
        config.fetch.backoff.enabled = env_var("BACKOFF_ENABLED")
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(config.fetch.backoff.enabled);
        if let Some(d) = env_ms("BACKOFF_INITIAL_MS") {
            config.fetch.backoff.initial = d;
        }
        if let Some(d) = env_ms("BACKOFF_MAX_MS") {
            config.fetch.backoff.max = d;
        }
        if let Some(d) = env_ms("REFETCH_DEBOUNCE_MS") {
            config.refetch_debounce = d;
        }
        if let Some(n) = env_var("DEDUP_WINDOW").and_then(|s| s.parse().ok()) {
            config.dedup_window = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_age.is_zero() {
            return Err(invalid("default_max_age", "0", "must be greater than zero"));
        }
        for (kind, ttl) in self.ttls.entries() {
            if ttl.is_zero() {
                return Err(invalid(
                    &format!("ttls.{}", kind),
                    "0",
                    "entry TTLs must be greater than zero",
                ));
            }
        }
        if self.fetch.max_debounce_window > self.fetch.max_debounce_wait {
            return Err(invalid(
                "fetch.max_debounce_window",
                &format!("{}ms", self.fetch.max_debounce_window.as_millis()),
                "must not exceed fetch.max_debounce_wait",
            ));
        }
        if let Some(timeout) = self.fetch.fetch_timeout {
            if timeout.is_zero() {
                return Err(invalid("fetch.fetch_timeout", "0", "must be greater than zero"));
            }
        }
        let backoff = &self.fetch.backoff;
        if !(backoff.multiplier >= 1.0) {
            return Err(invalid(
                "fetch.backoff.multiplier",
                &backoff.multiplier.to_string(),
                "must be at least 1.0",
            ));
        }
        if backoff.initial > backoff.max {
            return Err(invalid(
                "fetch.backoff.initial",
                &format!("{}ms", backoff.initial.as_millis()),
                "must not exceed fetch.backoff.max",
            ));
        }
        if self.dedup_window == 0 {
            return Err(invalid("dedup_window", "0", "must be at least 1"));
        }
        if self.signal_capacity == 0 || self.event_capacity == 0 {
            return Err(invalid("capacity", "0", "channel capacities must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_ms(name: &str) -> Option<Duration> {
    env_var(name)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
