//! Error taxonomy for store operations
//!
//! Every fallible operation returns [`StoreResult`]. Variants map to
//! caller-visible failure classes: absence (`NotFound`,
//! `VersionNotFound`), rejection (`PermissionDenied`, `Validation`),
//! contention (`Concurrency`), and environment faults (`Storage`,
//! `Io`). Backends never panic on bad input or bad state.

use thiserror::Error;

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure classes surfaced by every backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The entity does not exist (or is soft-deleted).
    #[error("entity not found: {0}")]
    NotFound(String),

    /// The entity exists but the requested version does not.
    #[error("version {version} of entity {entity_id} not found")]
    VersionNotFound {
        /// Entity identifier
        entity_id: String,
        /// Requested version
        version: u64,
    },

    /// The caller does not own the entity.
    #[error("permission denied for entity: {0}")]
    PermissionDenied(String),

    /// The request itself is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An entity lock could not be acquired within the timeout.
    #[error("timed out waiting for lock on entity: {0}")]
    Concurrency(String),

    /// Corrupt or inconsistent stored state.
    #[error("storage error: {0}")]
    Storage(String),

    /// An underlying filesystem operation failed.
    #[error("io error during {context}: {source}")]
    Io {
        /// What the store was doing when the operation failed
        context: String,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Absence of an entity.
    pub fn not_found(entity_id: impl Into<String>) -> Self {
        StoreError::NotFound(entity_id.into())
    }

    /// Absence of a specific version.
    pub fn version_not_found(entity_id: impl Into<String>, version: u64) -> Self {
        StoreError::VersionNotFound {
            entity_id: entity_id.into(),
            version,
        }
    }

    /// A malformed request.
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    /// Corrupt or inconsistent stored state.
    pub fn storage(message: impl Into<String>) -> Self {
        StoreError::Storage(message.into())
    }

    /// A failed filesystem operation, with what the store was doing.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error reports absence rather than failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::VersionNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Storage(format!("serialization failed: {err}"))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(format!("sqlite: {err}"))
    }
}
