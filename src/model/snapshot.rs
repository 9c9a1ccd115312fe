//! Immutable per-version snapshot record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Payload;

/// One persisted state of an entity at a point in time.
///
/// Immutable once created: no store operation ever rewrites a
/// previously returned snapshot's payload. Backends that hold
/// snapshots in memory always append, never mutate in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Identifier of the entity this version belongs to
    pub entity_id: String,

    /// Version number, contiguous from 1 per entity
    pub version: u64,

    /// The opaque payload tree
    pub payload: Payload,

    /// When this version was created
    pub timestamp: DateTime<Utc>,

    /// Optional caller-supplied summary of what changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,

    /// Caller-supplied metadata, opaque to the store
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl Snapshot {
    /// Create a new snapshot record.
    pub fn new(
        entity_id: impl Into<String>,
        version: u64,
        payload: Payload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            version,
            payload,
            timestamp,
            change_summary: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a change summary.
    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.change_summary = summary;
        self
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
