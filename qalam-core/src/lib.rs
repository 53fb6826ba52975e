//! QALAM Core - Shared Types
//!
//! Pure data structures shared by the cache engine and the change-event
//! bridge: subject identity, entity kinds, change events, normalized entity
//! shapes, errors and configuration. Collaborator contracts for the backend
//! live here too so that mocks can be built without depending on the engine.
//!
//! This crate performs no I/O and owns no timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

mod backend;
mod config;
mod entities;
mod error;
mod event;

pub use backend::AvatarBackend;
pub use config::{BackoffConfig, CacheConfig, FetchConfig, KindTtls};
pub use entities::{
    AvatarProfile, AvatarRecord, AvatarSource, InventoryItem, LevelInfo, Resolved, ShopItem,
    DEFAULT_LEVEL,
};
pub use error::{
    CacheError, ConfigError, QalamError, QalamResult, SourceError, ValidationError,
};
pub use event::{CacheSignal, ChangeEvent, ChangeKind, Topic};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of the subject (usually a user) that cached entities belong to.
///
/// Subject ids are embedded in cache keys, so they may not be empty and may
/// not contain whitespace or the `:` discriminator separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    /// Validate and wrap a subject id.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::InvalidSubject {
                value,
                reason: "subject id is empty".to_string(),
            });
        }
        if value.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(ValidationError::InvalidSubject {
                value,
                reason: "subject id may not contain whitespace or ':'".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Subject ids minted by the backend are UUIDs; those are always valid.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SubjectId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubjectId> for String {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}

impl From<Uuid> for SubjectId {
    fn from(id: Uuid) -> Self {
        Self::from_uuid(id)
    }
}

// ============================================================================
// ENTITY KINDS
// ============================================================================

/// A named category of cached data for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Avatar,
    Badge,
    Profile,
    Level,
    Notifications,
    RatingEligibility,
    Inventory,
}

impl EntityKind {
    /// Every kind, in key-table order.
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Avatar,
        EntityKind::Badge,
        EntityKind::Profile,
        EntityKind::Level,
        EntityKind::Notifications,
        EntityKind::RatingEligibility,
        EntityKind::Inventory,
    ];

    /// Key segment for this kind. Never contains `_`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Avatar => "avatar",
            EntityKind::Badge => "badge",
            EntityKind::Profile => "profile",
            EntityKind::Level => "level",
            EntityKind::Notifications => "notifications",
            EntityKind::RatingEligibility => "rating-eligibility",
            EntityKind::Inventory => "inventory",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownKind {
                value: s.to_string(),
            })
    }
}
