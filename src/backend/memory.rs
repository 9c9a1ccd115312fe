//! In-memory backend
//!
//! The reference implementation for tests and backend-equivalence
//! checking. Version records are append-only: a stored snapshot is
//! never mutated in place, archival moves whole records to a separate
//! list.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::backend::{
    derive_search_fields, paginate, validate_entity_id, ExportBundle, QueryFilter, SaveRequest,
    StorageBackend, StoreStats,
};
use crate::compress::{compute_checksum, format_checksum, Compression};
use crate::diff::Diff;
use crate::errors::{StoreError, StoreResult};
use crate::locks::{LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::model::{IndexEntry, Payload, Snapshot, VersionMetadata};
use crate::observability::{Logger, Severity};

/// All state for one entity.
struct EntityRecord {
    entry: IndexEntry,
    /// Active versions, ascending
    records: Vec<(Snapshot, VersionMetadata)>,
    /// Versions moved out of active storage by archival
    archived: Vec<(Snapshot, VersionMetadata)>,
}

impl EntityRecord {
    fn active_payload(&self, version: u64) -> Option<&Payload> {
        self.records
            .iter()
            .find(|(s, _)| s.version == version)
            .map(|(s, _)| &s.payload)
    }
}

/// Backend over in-process maps.
pub struct MemoryBackend {
    entities: RwLock<HashMap<String, EntityRecord>>,
    locks: LockTable,
}

impl MemoryBackend {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create with a custom lock acquisition timeout.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            locks: LockTable::new(timeout),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn save(&self, request: SaveRequest) -> StoreResult<Snapshot> {
        validate_entity_id(&request.entity_id)?;
        let _guard = self.locks.acquire(&request.entity_id)?;
        let now = Utc::now();

        let payload_bytes = serde_json::to_vec(&request.payload)?;
        let checksum = format_checksum(compute_checksum(&payload_bytes));

        let mut entities = self.entities.write();
        let record = entities
            .entry(request.entity_id.clone())
            .or_insert_with(|| EntityRecord {
                entry: IndexEntry::new(
                    &request.entity_id,
                    request.display_name.as_deref().unwrap_or(&request.entity_id),
                    request.owner_id.clone(),
                    now,
                ),
                records: Vec::new(),
                archived: Vec::new(),
            });

        if !record.entry.owner_matches(request.owner_id.as_deref()) {
            return Err(StoreError::PermissionDenied(request.entity_id.clone()));
        }

        let version = record.entry.latest_version + 1;
        let changed_fields = match record.active_payload(record.entry.latest_version) {
            Some(previous) => {
                Diff::between(&request.entity_id, version - 1, version, previous, &request.payload)
                    .changed_fields()
            }
            None => Vec::new(),
        };

        let snapshot = Snapshot::new(&request.entity_id, version, request.payload.clone(), now)
            .with_summary(request.change_summary.clone())
            .with_metadata(request.metadata.clone());
        let meta = VersionMetadata {
            entity_id: request.entity_id.clone(),
            version,
            timestamp: now,
            changed_fields,
            data_size: payload_bytes.len() as u64,
            compressed_size: None,
            compression: Compression::None,
            checksum: Some(checksum),
            is_full_snapshot: true,
        };

        let display_name = request
            .display_name
            .clone()
            .unwrap_or_else(|| record.entry.display_name.clone());
        record.entry.record_save(
            version,
            &display_name,
            now,
            derive_search_fields(&request.payload),
        );
        record.records.push((snapshot.clone(), meta));

        Logger::log(
            Severity::Info,
            "save",
            &[
                ("backend", "memory"),
                ("entity_id", &request.entity_id),
                ("version", &version.to_string()),
            ],
        );
        Ok(snapshot)
    }

    fn get(
        &self,
        entity_id: &str,
        version: Option<u64>,
        owner: Option<&str>,
    ) -> StoreResult<Snapshot> {
        let mut entities = self.entities.write();
        let record = entities
            .get_mut(entity_id)
            .filter(|r| !r.entry.is_deleted)
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        if !record.entry.owner_matches(owner) {
            return Err(StoreError::PermissionDenied(entity_id.to_string()));
        }

        let wanted = version.unwrap_or(record.entry.latest_version);
        let snapshot = record
            .records
            .iter()
            .find(|(s, _)| s.version == wanted)
            .map(|(s, _)| s.clone())
            .ok_or_else(|| StoreError::version_not_found(entity_id, wanted))?;

        record.entry.record_access(Utc::now());
        Ok(snapshot)
    }

    fn history(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Snapshot>> {
        let entities = self.entities.read();
        let record = match entities.get(entity_id).filter(|r| !r.entry.is_deleted) {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };
        let mut snapshots: Vec<Snapshot> =
            record.records.iter().map(|(s, _)| s.clone()).collect();
        snapshots.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(paginate(snapshots, limit, offset))
    }

    fn diff(&self, entity_id: &str, from_version: u64, to_version: u64) -> StoreResult<Diff> {
        let entities = self.entities.read();
        let record = entities
            .get(entity_id)
            .filter(|r| !r.entry.is_deleted)
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        let old = record
            .active_payload(from_version)
            .ok_or_else(|| StoreError::version_not_found(entity_id, from_version))?;
        let new = record
            .active_payload(to_version)
            .ok_or_else(|| StoreError::version_not_found(entity_id, to_version))?;
        Ok(Diff::between(entity_id, from_version, to_version, old, new))
    }

    fn query(&self, filter: &QueryFilter) -> StoreResult<Vec<Snapshot>> {
        let entities = self.entities.read();
        let mut matches: Vec<&EntityRecord> = entities
            .values()
            .filter(|r| filter.matches(&r.entry))
            .collect();
        matches.sort_by(|a, b| {
            b.entry
                .last_modified
                .cmp(&a.entry.last_modified)
                .then_with(|| a.entry.entity_id.cmp(&b.entry.entity_id))
        });

        let snapshots: Vec<Snapshot> = matches
            .into_iter()
            .filter_map(|r| {
                r.active_payload(r.entry.latest_version)?;
                r.records
                    .iter()
                    .find(|(s, _)| s.version == r.entry.latest_version)
                    .map(|(s, _)| s.clone())
            })
            .collect();
        Ok(paginate(snapshots, filter.limit, filter.offset))
    }

    fn delete(&self, entity_id: &str, owner: Option<&str>, hard: bool) -> StoreResult<bool> {
        let _guard = self.locks.acquire(entity_id)?;
        let mut entities = self.entities.write();
        match entities.get(entity_id) {
            None => return Ok(false),
            Some(record) if !record.entry.owner_matches(owner) => {
                return Err(StoreError::PermissionDenied(entity_id.to_string()));
            }
            Some(_) => {}
        }

        let deleted = if hard {
            entities.remove(entity_id).is_some()
        } else {
            match entities.get_mut(entity_id) {
                Some(record) if !record.entry.is_deleted => {
                    record.entry.is_deleted = true;
                    true
                }
                _ => false,
            }
        };

        if deleted {
            Logger::log(
                Severity::Info,
                "delete",
                &[
                    ("backend", "memory"),
                    ("entity_id", entity_id),
                    ("hard", if hard { "true" } else { "false" }),
                ],
            );
        }
        Ok(deleted)
    }

    fn archive(&self, before: DateTime<Utc>, keep_every_nth: u32) -> StoreResult<u64> {
        let mut entities = self.entities.write();
        let mut archived_total = 0u64;

        for record in entities.values_mut() {
            let metas: Vec<VersionMetadata> =
                record.records.iter().map(|(_, m)| m.clone()).collect();
            let to_archive = crate::retention::select_versions_to_archive(
                &metas,
                record.entry.latest_version,
                before,
                keep_every_nth,
            );
            if to_archive.is_empty() {
                continue;
            }
            let (moved, kept): (Vec<_>, Vec<_>) = record
                .records
                .drain(..)
                .partition(|(s, _)| to_archive.contains(&s.version));
            archived_total += moved.len() as u64;
            record.archived.extend(moved);
            record.records = kept;
            record.entry.total_versions = record.records.len() as u64;
        }

        Logger::log(
            Severity::Info,
            "archive",
            &[
                ("backend", "memory"),
                ("archived", &archived_total.to_string()),
            ],
        );
        Ok(archived_total)
    }

    fn export(&self, entity_id: &str, include_history: bool) -> StoreResult<Vec<u8>> {
        let entities = self.entities.read();
        let record = entities
            .get(entity_id)
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        ExportBundle::new(record.entry.clone(), record.records.clone(), include_history)
            .to_bytes()
    }

    fn import(&self, bytes: &[u8]) -> StoreResult<Snapshot> {
        let bundle = ExportBundle::from_bytes(bytes)?;
        let (entry, records) = bundle.into_normalized();
        validate_entity_id(&entry.entity_id)?;
        let entity_id = entry.entity_id.clone();

        let _guard = self.locks.acquire(&entity_id)?;
        let latest = records
            .last()
            .map(|(s, _)| s.clone())
            .ok_or_else(|| StoreError::validation("bundle contains no snapshots"))?;

        self.entities.write().insert(
            entity_id.clone(),
            EntityRecord {
                entry,
                records,
                archived: Vec::new(),
            },
        );

        Logger::log(
            Severity::Info,
            "import",
            &[("backend", "memory"), ("entity_id", &entity_id)],
        );
        Ok(latest)
    }

    fn list_versions(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        let entities = self.entities.read();
        let record = entities
            .get(entity_id)
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        Ok(record.records.iter().map(|(_, m)| m.clone()).collect())
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let entities = self.entities.read();
        let mut stats = StoreStats::default();
        for record in entities.values() {
            stats.entity_count += 1;
            stats.version_count += record.records.len() as u64;
            stats.total_data_size += record.records.iter().map(|(_, m)| m.data_size).sum::<u64>();
        }
        Ok(stats)
    }

    fn shutdown(&self) -> StoreResult<()> {
        Ok(())
    }
}
