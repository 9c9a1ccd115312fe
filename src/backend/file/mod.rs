//! File-based backend
//!
//! Directory-per-entity JSON storage. Version payloads are compressed
//! individually; `latest.json` is an uncompressed fast path for the
//! current snapshot. The root `index.json` is the only cross-entity
//! shared file and every rewrite of it goes through the atomic-rename
//! primitive, under the index lock.

pub(crate) mod layout;

pub use layout::Layout;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::backend::{
    derive_search_fields, paginate, validate_entity_id, ExportBundle, QueryFilter, SaveRequest,
    StorageBackend, StoreStats,
};
use crate::compress::{compute_checksum, format_checksum, verify_checksum, Compression};
use crate::diff::Diff;
use crate::errors::{StoreError, StoreResult};
use crate::locks::{LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::model::{IndexEntry, Snapshot, VersionMetadata};
use crate::observability::{Logger, Severity};

use layout::{read_json, read_json_or_default, write_json_atomic};

/// Backend over a directory tree of JSON files.
pub struct FileBackend {
    layout: Layout,
    compression: Compression,
    /// In-memory mirror of `index.json`; the index lock for the
    /// read-modify-write-rename cycle
    index: RwLock<BTreeMap<String, IndexEntry>>,
    locks: LockTable,
}

impl FileBackend {
    /// Open (or create) a store rooted at `root`.
    pub fn open(
        root: impl AsRef<Path>,
        compression: Compression,
        lock_timeout: Duration,
    ) -> StoreResult<Self> {
        let layout = Layout::new(root.as_ref());
        layout::ensure_dir(layout.root())?;
        let index: BTreeMap<String, IndexEntry> =
            read_json_or_default(&layout.index_path())?;
        Ok(Self {
            layout,
            compression,
            index: RwLock::new(index),
            locks: LockTable::new(lock_timeout),
        })
    }

    /// Open with gzip compression and the default lock timeout.
    pub fn open_default(root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(root, Compression::Gzip, DEFAULT_LOCK_TIMEOUT)
    }

    /// The storage root directory.
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn persist_index(&self, index: &BTreeMap<String, IndexEntry>) -> StoreResult<()> {
        write_json_atomic(&self.layout.index_path(), index)
    }

    fn load_metadata(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        read_json_or_default(&self.layout.metadata_path(entity_id))
    }

    /// Active version metadata: what `metadata.json` lists, clamped to
    /// the index's latest version so a torn save never surfaces a
    /// version the index does not acknowledge.
    fn active_metadata(
        &self,
        entity_id: &str,
        entry: &IndexEntry,
    ) -> StoreResult<Vec<VersionMetadata>> {
        let mut metas = self.load_metadata(entity_id)?;
        metas.retain(|m| m.version <= entry.latest_version);
        metas.sort_by_key(|m| m.version);
        Ok(metas)
    }

    fn write_version_file(&self, snapshot: &Snapshot, meta: &VersionMetadata) -> StoreResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let encoded = meta.compression.encode(&bytes)?;
        layout::write_atomic(
            &self
                .layout
                .version_path(&snapshot.entity_id, snapshot.version, meta.compression),
            &encoded,
        )
    }

    fn read_version_file(&self, meta: &VersionMetadata) -> StoreResult<Snapshot> {
        let path = self
            .layout
            .version_path(&meta.entity_id, meta.version, meta.compression);
        let raw = fs::read(&path)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;
        let bytes = meta.compression.decode(&raw)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::storage(format!("corrupt snapshot {}: {e}", path.display())))?;
        if let Some(recorded) = &meta.checksum {
            let payload_bytes = serde_json::to_vec(&snapshot.payload)?;
            verify_checksum(&payload_bytes, recorded)?;
        }
        Ok(snapshot)
    }

    /// Read one version, preferring the uncompressed `latest.json`
    /// fast path when it is current.
    fn read_snapshot(&self, entry: &IndexEntry, version: u64) -> StoreResult<Snapshot> {
        if version == entry.latest_version {
            let latest_path = self.layout.latest_path(&entry.entity_id);
            if latest_path.exists() {
                let snapshot: Snapshot = read_json(&latest_path)?;
                if snapshot.version == version {
                    return Ok(snapshot);
                }
            }
        }
        let metas = self.active_metadata(&entry.entity_id, entry)?;
        let meta = metas
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| StoreError::version_not_found(&entry.entity_id, version))?;
        self.read_version_file(meta)
    }

    fn live_entry(&self, entity_id: &str) -> StoreResult<IndexEntry> {
        self.index
            .read()
            .get(entity_id)
            .filter(|e| !e.is_deleted)
            .cloned()
            .ok_or_else(|| StoreError::not_found(entity_id))
    }

    fn build_metadata(
        &self,
        entity_id: &str,
        version: u64,
        now: DateTime<Utc>,
        changed_fields: Vec<String>,
        data_size: u64,
        compressed_size: Option<u64>,
        checksum: String,
    ) -> VersionMetadata {
        VersionMetadata {
            entity_id: entity_id.to_string(),
            version,
            timestamp: now,
            changed_fields,
            data_size,
            compressed_size,
            compression: self.compression,
            checksum: Some(checksum),
            is_full_snapshot: true,
        }
    }

    fn remove_entity_files(&self, entity_id: &str) -> StoreResult<()> {
        for dir in [
            self.layout.entity_dir(entity_id),
            self.layout.archive_dir(entity_id),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .map_err(|e| StoreError::io(format!("remove {}", dir.display()), e))?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn save(&self, request: SaveRequest) -> StoreResult<Snapshot> {
        validate_entity_id(&request.entity_id)?;
        let _guard = self.locks.acquire(&request.entity_id)?;
        let now = Utc::now();

        let existing = self.index.read().get(&request.entity_id).cloned();
        if let Some(entry) = &existing {
            if !entry.owner_matches(request.owner_id.as_deref()) {
                return Err(StoreError::PermissionDenied(request.entity_id.clone()));
            }
        }

        let version = existing.as_ref().map_or(0, |e| e.latest_version) + 1;
        let changed_fields = match &existing {
            Some(entry) => {
                let previous = self.read_snapshot(entry, entry.latest_version)?;
                Diff::between(
                    &request.entity_id,
                    entry.latest_version,
                    version,
                    &previous.payload,
                    &request.payload,
                )
                .changed_fields()
            }
            None => Vec::new(),
        };

        let payload_bytes = serde_json::to_vec(&request.payload)?;
        let checksum = format_checksum(compute_checksum(&payload_bytes));
        let snapshot = Snapshot::new(&request.entity_id, version, request.payload.clone(), now)
            .with_summary(request.change_summary.clone())
            .with_metadata(request.metadata.clone());

        let snapshot_bytes = serde_json::to_vec(&snapshot)?;
        let encoded = self.compression.encode(&snapshot_bytes)?;
        let compressed_size = match self.compression {
            Compression::None => None,
            _ => Some(encoded.len() as u64),
        };
        let meta = self.build_metadata(
            &request.entity_id,
            version,
            now,
            changed_fields,
            payload_bytes.len() as u64,
            compressed_size,
            checksum,
        );

        // Version file, then metadata, then the latest fast path; the
        // index write is the commit point.
        layout::write_atomic(
            &self
                .layout
                .version_path(&request.entity_id, version, self.compression),
            &encoded,
        )?;
        let mut metas = self.load_metadata(&request.entity_id)?;
        metas.retain(|m| m.version != version);
        metas.push(meta);
        metas.sort_by_key(|m| m.version);
        write_json_atomic(&self.layout.metadata_path(&request.entity_id), &metas)?;
        write_json_atomic(&self.layout.latest_path(&request.entity_id), &snapshot)?;

        {
            let mut index = self.index.write();
            let entry = index
                .entry(request.entity_id.clone())
                .or_insert_with(|| {
                    IndexEntry::new(
                        &request.entity_id,
                        request.display_name.as_deref().unwrap_or(&request.entity_id),
                        request.owner_id.clone(),
                        now,
                    )
                });
            let display_name = request
                .display_name
                .clone()
                .unwrap_or_else(|| entry.display_name.clone());
            entry.record_save(version, &display_name, now, derive_search_fields(&request.payload));
            self.persist_index(&index)?;
        }

        Logger::log(
            Severity::Info,
            "save",
            &[
                ("backend", "file"),
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
        let entry = self.live_entry(entity_id)?;
        if !entry.owner_matches(owner) {
            return Err(StoreError::PermissionDenied(entity_id.to_string()));
        }

        let wanted = version.unwrap_or(entry.latest_version);
        let snapshot = self.read_snapshot(&entry, wanted)?;

        {
            let mut index = self.index.write();
            if let Some(entry) = index.get_mut(entity_id) {
                entry.record_access(Utc::now());
                self.persist_index(&index)?;
            }
        }
        Ok(snapshot)
    }

    fn history(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Snapshot>> {
        let entry = match self.live_entry(entity_id) {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut metas = self.active_metadata(entity_id, &entry)?;
        metas.sort_by(|a, b| b.version.cmp(&a.version));
        paginate(metas, limit, offset)
            .iter()
            .map(|m| {
                if m.version == entry.latest_version {
                    self.read_snapshot(&entry, m.version)
                } else {
                    self.read_version_file(m)
                }
            })
            .collect()
    }

    fn diff(&self, entity_id: &str, from_version: u64, to_version: u64) -> StoreResult<Diff> {
        let entry = self.live_entry(entity_id)?;
        let old = self.read_snapshot(&entry, from_version)?;
        let new = self.read_snapshot(&entry, to_version)?;
        Ok(Diff::between(
            entity_id,
            from_version,
            to_version,
            &old.payload,
            &new.payload,
        ))
    }

    fn query(&self, filter: &QueryFilter) -> StoreResult<Vec<Snapshot>> {
        let mut entries: Vec<IndexEntry> = {
            let index = self.index.read();
            index
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        };
        entries.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        paginate(entries, filter.limit, filter.offset)
            .iter()
            .map(|entry| self.read_snapshot(entry, entry.latest_version))
            .collect()
    }

    fn delete(&self, entity_id: &str, owner: Option<&str>, hard: bool) -> StoreResult<bool> {
        let _guard = self.locks.acquire(entity_id)?;

        {
            let index = self.index.read();
            match index.get(entity_id) {
                None => return Ok(false),
                Some(entry) if !entry.owner_matches(owner) => {
                    return Err(StoreError::PermissionDenied(entity_id.to_string()));
                }
                Some(entry) if !hard && entry.is_deleted => return Ok(false),
                Some(_) => {}
            }
        }

        {
            let mut index = self.index.write();
            if hard {
                index.remove(entity_id);
            } else if let Some(entry) = index.get_mut(entity_id) {
                entry.is_deleted = true;
            }
            self.persist_index(&index)?;
        }
        if hard {
            self.remove_entity_files(entity_id)?;
        }

        Logger::log(
            Severity::Info,
            "delete",
            &[
                ("backend", "file"),
                ("entity_id", entity_id),
                ("hard", if hard { "true" } else { "false" }),
            ],
        );
        Ok(true)
    }

    fn archive(&self, before: DateTime<Utc>, keep_every_nth: u32) -> StoreResult<u64> {
        let entity_ids: Vec<String> = self.index.read().keys().cloned().collect();
        let mut archived_total = 0u64;

        for entity_id in entity_ids {
            let _guard = self.locks.acquire(&entity_id)?;
            let entry = match self.index.read().get(&entity_id).cloned() {
                Some(entry) => entry,
                None => continue,
            };
            let metas = self.active_metadata(&entity_id, &entry)?;
            let to_archive = crate::retention::select_versions_to_archive(
                &metas,
                entry.latest_version,
                before,
                keep_every_nth,
            );
            if to_archive.is_empty() {
                continue;
            }

            layout::ensure_dir(&self.layout.archive_dir(&entity_id))?;
            let mut archived_metas: Vec<VersionMetadata> =
                read_json_or_default(&self.layout.archive_metadata_path(&entity_id))?;
            let (moved, kept): (Vec<_>, Vec<_>) = metas
                .into_iter()
                .partition(|m| to_archive.contains(&m.version));

            for meta in &moved {
                let from = self
                    .layout
                    .version_path(&entity_id, meta.version, meta.compression);
                let to = self
                    .layout
                    .archive_version_path(&entity_id, meta.version, meta.compression);
                fs::rename(&from, &to).map_err(|e| {
                    StoreError::io(
                        format!("archive {} -> {}", from.display(), to.display()),
                        e,
                    )
                })?;
            }
            archived_total += moved.len() as u64;
            archived_metas.extend(moved);
            archived_metas.sort_by_key(|m| m.version);
            write_json_atomic(
                &self.layout.archive_metadata_path(&entity_id),
                &archived_metas,
            )?;
            write_json_atomic(&self.layout.metadata_path(&entity_id), &kept)?;

            let mut index = self.index.write();
            if let Some(entry) = index.get_mut(&entity_id) {
                entry.total_versions = kept.len() as u64;
            }
            self.persist_index(&index)?;
        }

        Logger::log(
            Severity::Info,
            "archive",
            &[
                ("backend", "file"),
                ("archived", &archived_total.to_string()),
            ],
        );
        Ok(archived_total)
    }

    fn export(&self, entity_id: &str, include_history: bool) -> StoreResult<Vec<u8>> {
        let entry = self
            .index
            .read()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        let metas = self.active_metadata(entity_id, &entry)?;
        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            let snapshot = if meta.version == entry.latest_version {
                self.read_snapshot(&entry, meta.version)?
            } else {
                self.read_version_file(&meta)?
            };
            records.push((snapshot, meta));
        }
        ExportBundle::new(entry, records, include_history).to_bytes()
    }

    fn import(&self, bytes: &[u8]) -> StoreResult<Snapshot> {
        let bundle = ExportBundle::from_bytes(bytes)?;
        let (mut entry, records) = bundle.into_normalized();
        validate_entity_id(&entry.entity_id)?;
        let entity_id = entry.entity_id.clone();

        let _guard = self.locks.acquire(&entity_id)?;
        self.remove_entity_files(&entity_id)?;

        let mut metas = Vec::with_capacity(records.len());
        let mut latest: Option<Snapshot> = None;
        for (snapshot, mut meta) in records {
            // Imported payloads are re-encoded with this store's
            // compression mode.
            meta.compression = self.compression;
            let snapshot_bytes = serde_json::to_vec(&snapshot)?;
            let encoded = self.compression.encode(&snapshot_bytes)?;
            meta.compressed_size = match self.compression {
                Compression::None => None,
                _ => Some(encoded.len() as u64),
            };
            layout::write_atomic(
                &self
                    .layout
                    .version_path(&entity_id, snapshot.version, self.compression),
                &encoded,
            )?;
            metas.push(meta);
            latest = Some(snapshot);
        }
        let latest =
            latest.ok_or_else(|| StoreError::validation("bundle contains no snapshots"))?;

        write_json_atomic(&self.layout.metadata_path(&entity_id), &metas)?;
        write_json_atomic(&self.layout.latest_path(&entity_id), &latest)?;

        {
            let mut index = self.index.write();
            entry.search_fields = derive_search_fields(&latest.payload);
            index.insert(entity_id.clone(), entry);
            self.persist_index(&index)?;
        }

        Logger::log(
            Severity::Info,
            "import",
            &[("backend", "file"), ("entity_id", &entity_id)],
        );
        Ok(latest)
    }

    fn list_versions(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        let entry = self
            .index
            .read()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        self.active_metadata(entity_id, &entry)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let entries: Vec<IndexEntry> = self.index.read().values().cloned().collect();
        let mut stats = StoreStats::default();
        for entry in entries {
            stats.entity_count += 1;
            let metas = self.active_metadata(&entry.entity_id, &entry)?;
            stats.version_count += metas.len() as u64;
            stats.total_data_size += metas.iter().map(|m| m.data_size).sum::<u64>();
        }
        Ok(stats)
    }

    fn shutdown(&self) -> StoreResult<()> {
        // All writes are synchronous and fsynced; persist the index a
        // final time so access statistics are not lost.
        let index = self.index.read();
        self.persist_index(&index)
    }
}
