//! Denormalized per-entity index entry
//!
//! One entry per entity, mutated in place as versions arrive. All
//! mutation goes through the helpers here so every backend applies
//! identical index semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fast-lookup metadata covering one entity's latest state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Entity identifier
    pub entity_id: String,

    /// Human-readable name used for substring queries
    pub display_name: String,

    /// Highest version currently stored (never lags actual storage)
    pub latest_version: u64,

    /// Number of versions in active storage (archived versions excluded)
    pub total_versions: u64,

    /// When version 1 was saved
    pub created_at: DateTime<Utc>,

    /// When the latest version was saved
    pub last_modified: DateTime<Utc>,

    /// When the entity was last read, if ever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,

    /// Number of successful reads
    #[serde(default)]
    pub access_count: u64,

    /// Owner identifier; when set, reads and deletes require a match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    /// Soft-delete flag; hidden from the default API surface when set
    #[serde(default)]
    pub is_deleted: bool,

    /// Denormalized payload fields used by query filters
    #[serde(default)]
    pub search_fields: serde_json::Map<String, Value>,
}

impl IndexEntry {
    /// Create the entry for an entity's first save.
    pub fn new(
        entity_id: impl Into<String>,
        display_name: impl Into<String>,
        owner_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            display_name: display_name.into(),
            latest_version: 0,
            total_versions: 0,
            created_at: now,
            last_modified: now,
            last_accessed: None,
            access_count: 0,
            owner_id,
            is_deleted: false,
            search_fields: serde_json::Map::new(),
        }
    }

    /// Apply the index mutation for a newly persisted version.
    ///
    /// Saving to a soft-deleted entity revives it: a new version means
    /// the entity is live again.
    pub fn record_save(
        &mut self,
        version: u64,
        display_name: &str,
        now: DateTime<Utc>,
        search_fields: serde_json::Map<String, Value>,
    ) {
        self.latest_version = version;
        self.total_versions += 1;
        self.last_modified = now;
        self.display_name = display_name.to_string();
        self.search_fields = search_fields;
        self.is_deleted = false;
    }

    /// Apply the access-statistics mutation for a successful read.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.last_accessed = Some(now);
        self.access_count += 1;
    }

    /// Check the caller-supplied owner against this entry.
    ///
    /// Entities without an owner are readable by anyone.
    pub fn owner_matches(&self, caller: Option<&str>) -> bool {
        match self.owner_id.as_deref() {
            None => true,
            Some(owner) => caller == Some(owner),
        }
    }
}
