//! Change-notification and cross-instance signal types.

use crate::{EntityKind, SubjectId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Mutation type carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Publish/subscribe channel name, e.g. a backend table such as
/// `user_inventory`, optionally narrowed to one subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Topic for one table filtered to one subject: `<table>:<subject>`.
    pub fn for_subject(table: &str, subject: &SubjectId) -> Self {
        Self(format!("{}:{}", table, subject))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A row-level change delivered by the change-notification stream.
///
/// Delivery is at-least-once and unordered; consumers must treat every
/// event as independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Transport-assigned id, when the transport provides one. Redeliveries
    /// of one event share it. Two events with equal content but no id are
    /// distinct changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub topic: Topic,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub subject_id: SubjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<Timestamp>,
}

impl ChangeEvent {
    pub fn new(topic: Topic, kind: ChangeKind, subject_id: SubjectId) -> Self {
        Self {
            event_id: None,
            topic,
            kind,
            subject_id,
            new: None,
            old: None,
            committed_at: None,
        }
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_new(mut self, row: Value) -> Self {
        self.new = Some(row);
        self
    }

    pub fn with_old(mut self, row: Value) -> Self {
        self.old = Some(row);
        self
    }

    pub fn with_committed_at(mut self, at: Timestamp) -> Self {
        self.committed_at = Some(at);
        self
    }

    /// Look a column up on the new row, falling back to the old row
    /// (deletes only carry `old`).
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.new
            .as_ref()
            .and_then(|row| row.get(name))
            .or_else(|| self.old.as_ref().and_then(|row| row.get(name)))
    }

    /// True when either the new or the old row has `name == value`.
    pub fn touches(&self, name: &str, value: &Value) -> bool {
        let matches = |row: &Option<Value>| {
            row.as_ref()
                .and_then(|r| r.get(name))
                .is_some_and(|v| v == value)
        };
        matches(&self.new) || matches(&self.old)
    }

    /// True when the column differs between old and new rows. Inserts and
    /// deletes count as a change of every column present on either side.
    pub fn changed(&self, name: &str) -> bool {
        let new = self.new.as_ref().and_then(|r| r.get(name));
        let old = self.old.as_ref().and_then(|r| r.get(name));
        match (new, old) {
            (None, None) => false,
            (a, b) => a != b,
        }
    }
}

/// Cross-instance notice that `kind` for `subject_id` changed.
///
/// Emitted by the cache instance that performed a local mutation so that
/// other independent instances invalidate and refetch their own copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSignal {
    /// Instance that emitted the signal.
    pub origin: Uuid,
    pub subject_id: SubjectId,
    pub kind: EntityKind,
    pub emitted_at: Timestamp,
}

impl CacheSignal {
    pub fn new(origin: Uuid, subject_id: SubjectId, kind: EntityKind) -> Self {
        Self {
            origin,
            subject_id,
            kind,
            emitted_at: Utc::now(),
        }
    }
}
