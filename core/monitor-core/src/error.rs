//! Error types for monitor-core operations.
//!
//! Classification and state transitions never fail; only the storage
//! collaborator and configuration loading produce errors.

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures reported by an [`ActivityStore`](crate::store::ActivityStore) implementation.
///
/// All variants are considered transient by the persistence writer and retried
/// with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage query failed: {context}: {details}")]
    Query { context: String, details: String },

    #[error("Stored record is corrupt: {context}: {details}")]
    Corrupt { context: String, details: String },
}

impl StoreError {
    pub fn query(context: &str, details: impl std::fmt::Display) -> Self {
        StoreError::Query {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    pub fn corrupt(context: &str, details: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            context: context.to_string(),
            details: details.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracker Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by [`ActivityTracker::ingest`](crate::tracker::ActivityTracker::ingest).
///
/// Only storage reads on a cold cache can fail ingestion. The caller decides
/// whether to retry the signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Session lookup failed for user {user_id}: {source}")]
    SessionLookup {
        user_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Work block lookup failed for {context}: {source}")]
    WorkBlockLookup {
        context: String,
        #[source]
        source: StoreError,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
