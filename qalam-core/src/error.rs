//! Error types for QALAM cache operations

use std::time::Duration;
use thiserror::Error;

/// Fetch-path errors. These are fanned out to every caller joined on the
/// same key, so they are cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch failed for {key}: {reason}")]
    FetchFailed { key: String, reason: String },

    #[error("Fetch for {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Fetch for {key} was cancelled: {reason}")]
    Cancelled { key: String, reason: String },
}

/// Backend source errors, raised by probes and repair steps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Malformed value from {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid subject id {value:?}: {reason}")]
    InvalidSubject { value: String, reason: String },

    #[error("Unknown entity kind: {value}")]
    UnknownKind { value: String },

    #[error("Invalid cache key {value:?}: {reason}")]
    InvalidKey { value: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all QALAM errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QalamError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl QalamError {
    /// Shorthand for the common transient fetch failure.
    pub fn fetch_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        QalamError::Cache(CacheError::FetchFailed {
            key: key.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for an unavailable backend source.
    pub fn source_unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        QalamError::Source(SourceError::Unavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        })
    }
}

/// Result type alias for QALAM operations.
pub type QalamResult<T> = Result<T, QalamError>;

// =============================================================================
// TESTS
// =============================================================================
