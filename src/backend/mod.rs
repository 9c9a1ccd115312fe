//! Storage backend contract
//!
//! Every backend implements [`StorageBackend`] with identical
//! observable semantics: same version numbering, same diff results,
//! same query filtering. Callers can distinguish backends only by
//! persistence and performance, never by behavior.
//!
//! Cross-backend behavior that must not drift lives here or in
//! `model`/`retention` helpers: owner checks and index mutation
//! (`IndexEntry`), filter matching (`QueryFilter::matches`), search
//! field derivation, pagination, and the export bundle format.

mod bundle;
pub mod file;
pub mod memory;
pub mod sqlite;

pub use bundle::ExportBundle;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::Diff;
use crate::errors::{StoreError, StoreResult};
use crate::model::{IndexEntry, Payload, Snapshot, VersionMetadata};

use self::file::layout::{ARCHIVE_DIR, INDEX_FILE};

/// A save request from the upstream document producer.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Entity identifier
    pub entity_id: String,
    /// Display name; defaults to the entity id on first save and to
    /// the existing name afterwards
    pub display_name: Option<String>,
    /// The payload tree to persist
    pub payload: Payload,
    /// Owner identifier, fixed at entity creation
    pub owner_id: Option<String>,
    /// Optional summary of what changed
    pub change_summary: Option<String>,
    /// Caller metadata stored on the snapshot, opaque to the store
    pub metadata: serde_json::Map<String, Value>,
}

impl SaveRequest {
    /// Create a minimal save request.
    pub fn new(entity_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            entity_id: entity_id.into(),
            display_name: None,
            payload,
            owner_id: None,
            change_summary: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the owner.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    /// Set the change summary.
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.change_summary = Some(summary.into());
        self
    }
}

/// Half-open numeric range over a denormalized search field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    /// Search field holding the number (e.g. `level`)
    pub field: String,
    /// Inclusive lower bound
    pub min: Option<f64>,
    /// Inclusive upper bound
    pub max: Option<f64>,
}

/// Entity query filter; all provided criteria are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Restrict to these entity ids
    pub entity_ids: Option<Vec<String>>,
    /// Case-insensitive substrings; an entity matches when its display
    /// name contains any of them
    pub name_substrings: Option<Vec<String>>,
    /// Tags that must all be present in `search_fields["tags"]`
    pub tags: Option<Vec<String>>,
    /// Numeric range over a search field
    pub numeric_range: Option<NumericRange>,
    /// Only entities modified strictly after this instant
    pub modified_after: Option<DateTime<Utc>>,
    /// Only entities modified strictly before this instant
    pub modified_before: Option<DateTime<Utc>>,
    /// Only entities owned by this owner
    pub owner_id: Option<String>,
    /// Include soft-deleted entities (default false)
    pub include_deleted: bool,
    /// Page size
    pub limit: Option<usize>,
    /// Page offset
    pub offset: usize,
}

impl QueryFilter {
    /// Whether an index entry satisfies every provided criterion.
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if entry.is_deleted && !self.include_deleted {
            return false;
        }
        if let Some(ids) = &self.entity_ids {
            if !ids.iter().any(|id| id == &entry.entity_id) {
                return false;
            }
        }
        if let Some(substrings) = &self.name_substrings {
            let name = entry.display_name.to_lowercase();
            if !substrings
                .iter()
                .any(|s| name.contains(&s.to_lowercase()))
            {
                return false;
            }
        }
        if let Some(owner) = &self.owner_id {
            if entry.owner_id.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if entry.last_modified <= after {
                return false;
            }
        }
        if let Some(before) = self.modified_before {
            if entry.last_modified >= before {
                return false;
            }
        }
        self.matches_search_fields(entry)
    }

    /// The criteria evaluated against denormalized search fields.
    ///
    /// Split out because the SQL backend pushes everything else into
    /// its WHERE clause and applies only these in process.
    pub fn matches_search_fields(&self, entry: &IndexEntry) -> bool {
        if let Some(required) = &self.tags {
            let entity_tags: Vec<&str> = entry
                .search_fields
                .get("tags")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !required.iter().all(|t| entity_tags.contains(&t.as_str())) {
                return false;
            }
        }
        if let Some(range) = &self.numeric_range {
            let value = entry
                .search_fields
                .get(&range.field)
                .and_then(Value::as_f64);
            match value {
                None => return false,
                Some(v) => {
                    if range.min.is_some_and(|min| v < min) {
                        return false;
                    }
                    if range.max.is_some_and(|max| v > max) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Operational counters across the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Entities with an index entry (soft-deleted included)
    pub entity_count: u64,
    /// Versions in active storage
    pub version_count: u64,
    /// Sum of uncompressed payload sizes in active storage
    pub total_data_size: u64,
}

/// The operation set every backend implements identically.
pub trait StorageBackend: Send + Sync {
    /// Persist a new version of an entity, assigning the next
    /// contiguous version number and updating the index atomically.
    fn save(&self, request: SaveRequest) -> StoreResult<Snapshot>;

    /// Fetch one version (latest when `version` is `None`), applying
    /// the owner check and recording access statistics.
    ///
    /// Soft-deleted entities are indistinguishable from absent ones.
    fn get(&self, entity_id: &str, version: Option<u64>, owner: Option<&str>)
        -> StoreResult<Snapshot>;

    /// Version history, newest first.
    fn history(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Snapshot>>;

    /// Structural diff between two stored versions.
    fn diff(&self, entity_id: &str, from_version: u64, to_version: u64) -> StoreResult<Diff>;

    /// Latest snapshot of each matching entity, newest-modified first,
    /// paginated by the filter's limit/offset.
    fn query(&self, filter: &QueryFilter) -> StoreResult<Vec<Snapshot>>;

    /// Soft delete (flip the index flag) or hard delete (remove all
    /// versions and the index entry, irreversibly). Returns whether an
    /// entity was deleted.
    fn delete(&self, entity_id: &str, owner: Option<&str>, hard: bool) -> StoreResult<bool>;

    /// Move versions older than `before` (latest always retained) to
    /// the archive area, keeping every Nth candidate. Returns the
    /// number of versions archived.
    fn archive(&self, before: DateTime<Utc>, keep_every_nth: u32) -> StoreResult<u64>;

    /// Serialize an entity (latest only or full history) for backup or
    /// migration.
    fn export(&self, entity_id: &str, include_history: bool) -> StoreResult<Vec<u8>>;

    /// Restore an exported bundle, replacing any existing state for
    /// that entity. Returns the imported latest snapshot.
    fn import(&self, bytes: &[u8]) -> StoreResult<Snapshot>;

    /// Metadata of active versions, ascending by version.
    fn list_versions(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>>;

    /// Store-wide counters.
    fn stats(&self) -> StoreResult<StoreStats>;

    /// Flush and close handles; the backend must not be used after.
    fn shutdown(&self) -> StoreResult<()>;
}

/// Reject entity ids no backend can store: empty ids, dot paths, ids
/// containing path separators, or names the file layout reserves.
///
/// Every backend applies this at the top of `save` and `import`, so
/// acceptance never varies with the storage mechanism.
pub(crate) fn validate_entity_id(entity_id: &str) -> StoreResult<()> {
    if entity_id.is_empty() {
        return Err(StoreError::validation("entity_id must not be empty"));
    }
    if entity_id == ARCHIVE_DIR || entity_id == INDEX_FILE {
        return Err(StoreError::validation(format!(
            "entity_id '{entity_id}' collides with a reserved name"
        )));
    }
    if entity_id == "." || entity_id == ".." {
        return Err(StoreError::validation("entity_id must not be a dot path"));
    }
    if entity_id
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0')
    {
        return Err(StoreError::validation(format!(
            "entity_id '{entity_id}' contains path separators"
        )));
    }
    Ok(())
}

/// Derive the denormalized search fields for a payload: all top-level
/// scalars plus a top-level `"tags"` array of strings.
pub(crate) fn derive_search_fields(payload: &Payload) -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    for (key, value) in payload {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                fields.insert(key.clone(), value.clone());
            }
            Value::Array(items) if key == "tags" => {
                let tags: Vec<Value> = items
                    .iter()
                    .filter(|v| v.is_string())
                    .cloned()
                    .collect();
                fields.insert(key.clone(), Value::Array(tags));
            }
            _ => {}
        }
    }
    fields
}

/// Apply offset/limit pagination to an already ordered result set.
pub(crate) fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
