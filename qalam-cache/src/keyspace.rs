//! Cache keys and TTL policy.
//!
//! Keys are hierarchical strings, `<kind>_<subject>` with an optional
//! `:<discriminator>` suffix. Kind strings never contain `_` and subject ids
//! never contain `:`, so every rendered key parses back unambiguously.

use qalam_core::{CacheConfig, EntityKind, KindTtls, LevelInfo, SubjectId, ValidationError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ENTITY KEYS
// ============================================================================

/// Structured form of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    kind: EntityKind,
    subject: SubjectId,
    discriminator: Option<String>,
}

impl EntityKey {
    pub fn new(subject: SubjectId, kind: EntityKind) -> Self {
        Self {
            kind,
            subject,
            discriminator: None,
        }
    }

    /// Narrow the key, e.g. to one page of notifications.
    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Result<Self, ValidationError> {
        let discriminator = discriminator.into();
        if discriminator.is_empty() {
            return Err(ValidationError::InvalidKey {
                value: self.render(),
                reason: "discriminator is empty".to_string(),
            });
        }
        self.discriminator = Some(discriminator);
        Ok(self)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    /// The string form stored in the TTL store.
    pub fn render(&self) -> String {
        match &self.discriminator {
            Some(d) => format!("{}_{}:{}", self.kind, self.subject, d),
            None => format!("{}_{}", self.kind, self.subject),
        }
    }

    /// Parse a rendered key.
    pub fn parse(key: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidKey {
            value: key.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = key
            .split_once('_')
            .ok_or_else(|| invalid("missing '_' separator"))?;
        let kind: EntityKind = kind.parse()?;
        let (subject, discriminator) = match rest.split_once(':') {
            Some((_, "")) => return Err(invalid("discriminator is empty")),
            Some((subject, d)) => (subject, Some(d.to_string())),
            None => (rest, None),
        };
        let subject = SubjectId::new(subject)?;

        Ok(Self {
            kind,
            subject,
            discriminator,
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Which keys a bulk invalidation touches.
///
/// `Prefix` is a raw leading-substring match. The structured scopes parse
/// each key, so `Subject("u1")` never matches keys of `u10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    All,
    Prefix(String),
    /// Every kind for one subject (logout).
    Subject(SubjectId),
    /// One kind for one subject, any discriminator.
    Kind(SubjectId, EntityKind),
    Key(EntityKey),
}

impl KeyScope {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyScope::All => true,
            KeyScope::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyScope::Subject(subject) => {
                EntityKey::parse(key).is_ok_and(|k| k.subject == *subject)
            }
            KeyScope::Kind(subject, kind) => {
                EntityKey::parse(key).is_ok_and(|k| k.subject == *subject && k.kind == *kind)
            }
            KeyScope::Key(entity_key) => key == entity_key.render(),
        }
    }
}

// ============================================================================
// TTL RULES
// ============================================================================

/// How the TTL of a freshly fetched value is decided.
pub enum TtlRule<V> {
    Fixed(Duration),
    /// Derived from the value itself.
    Computed(Arc<dyn Fn(&V) -> Duration + Send + Sync>),
}

impl<V> TtlRule<V> {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&V) -> Duration + Send + Sync + 'static,
    {
        TtlRule::Computed(Arc::new(f))
    }

    pub fn ttl_for(&self, value: &V) -> Duration {
        match self {
            TtlRule::Fixed(ttl) => *ttl,
            TtlRule::Computed(f) => f(value),
        }
    }
}

impl<V> Clone for TtlRule<V> {
    fn clone(&self) -> Self {
        match self {
            TtlRule::Fixed(ttl) => TtlRule::Fixed(*ttl),
            TtlRule::Computed(f) => TtlRule::Computed(Arc::clone(f)),
        }
    }
}

impl<V> fmt::Debug for TtlRule<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlRule::Fixed(ttl) => f.debug_tuple("Fixed").field(ttl).finish(),
            TtlRule::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<V> From<Duration> for TtlRule<V> {
    fn from(ttl: Duration) -> Self {
        TtlRule::Fixed(ttl)
    }
}

// ============================================================================
// POLICY
// ============================================================================

/// Maps `(subject, kind)` to a cache key and the kind's TTL.
#[derive(Debug, Clone, Default)]
pub struct KeyspacePolicy {
    ttls: KindTtls,
}

impl KeyspacePolicy {
    pub fn new(ttls: KindTtls) -> Self {
        Self { ttls }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttls.clone())
    }

    pub fn key(&self, subject: &SubjectId, kind: EntityKind) -> (EntityKey, Duration) {
        (EntityKey::new(subject.clone(), kind), self.ttl(kind))
    }

    pub fn ttl(&self, kind: EntityKind) -> Duration {
        self.ttls.ttl(kind)
    }

    pub fn ttls(&self) -> &KindTtls {
        &self.ttls
    }

    /// Fixed rule for `kind`.
    pub fn rule<V>(&self, kind: EntityKind) -> TtlRule<V> {
        TtlRule::Fixed(self.ttl(kind))
    }

    /// Levels that are still the unearned default are re-checked sooner.
    pub fn level_ttl_rule(&self) -> TtlRule<LevelInfo> {
        let earned = self.ttls.level;
        let unearned = self.ttls.level_unearned;
        TtlRule::computed(move |level: &LevelInfo| {
            if level.is_unearned() {
                unearned
            } else {
                earned
            }
        })
    }
}
