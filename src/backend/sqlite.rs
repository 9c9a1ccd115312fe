//! Embedded SQLite backend
//!
//! One database file, three tables: `entity_index` mirrors the
//! in-memory/file index, `entity_versions` holds one row per active
//! version with the compressed payload JSON as a BLOB, and
//! `entity_versions_archive` receives rows moved out by `Archive`.
//! Save, delete, and import run inside transactions so the index and
//! version rows can never disagree.
//!
//! Index criteria that map cleanly to SQL are pushed into the WHERE
//! clause; rows are then re-checked with the shared filter code so
//! query semantics cannot drift from the other backends.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

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

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entity_index (
    entity_id      TEXT PRIMARY KEY,
    display_name   TEXT NOT NULL,
    latest_version INTEGER NOT NULL,
    total_versions INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    last_modified  TEXT NOT NULL,
    last_accessed  TEXT,
    access_count   INTEGER NOT NULL DEFAULT 0,
    owner_id       TEXT,
    is_deleted     INTEGER NOT NULL DEFAULT 0,
    search_fields  TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS entity_versions (
    entity_id        TEXT NOT NULL,
    version          INTEGER NOT NULL,
    timestamp        TEXT NOT NULL,
    change_summary   TEXT,
    changed_fields   TEXT NOT NULL DEFAULT '[]',
    data_size        INTEGER NOT NULL,
    compressed_size  INTEGER,
    compression      TEXT NOT NULL,
    checksum         TEXT,
    is_full_snapshot INTEGER NOT NULL DEFAULT 1,
    metadata         TEXT NOT NULL DEFAULT '{}',
    payload          BLOB NOT NULL,
    PRIMARY KEY (entity_id, version)
);
CREATE TABLE IF NOT EXISTS entity_versions_archive (
    entity_id        TEXT NOT NULL,
    version          INTEGER NOT NULL,
    timestamp        TEXT NOT NULL,
    change_summary   TEXT,
    changed_fields   TEXT NOT NULL DEFAULT '[]',
    data_size        INTEGER NOT NULL,
    compressed_size  INTEGER,
    compression      TEXT NOT NULL,
    checksum         TEXT,
    is_full_snapshot INTEGER NOT NULL DEFAULT 1,
    metadata         TEXT NOT NULL DEFAULT '{}',
    payload          BLOB NOT NULL,
    PRIMARY KEY (entity_id, version)
);
CREATE INDEX IF NOT EXISTS idx_entity_index_last_modified
    ON entity_index (last_modified);
";

const INDEX_COLUMNS: &str = "entity_id, display_name, latest_version, total_versions, \
     created_at, last_modified, last_accessed, access_count, owner_id, is_deleted, \
     search_fields";

const META_COLUMNS: &str = "entity_id, version, timestamp, changed_fields, data_size, \
     compressed_size, compression, checksum, is_full_snapshot";

const SNAPSHOT_COLUMNS: &str =
    "version, timestamp, change_summary, metadata, compression, checksum, payload";

/// RFC 3339 with fixed-width microseconds, so TEXT comparison in SQL
/// orders timestamps correctly.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        entity_id: row.get(0)?,
        display_name: row.get(1)?,
        latest_version: row.get::<_, i64>(2)? as u64,
        total_versions: row.get::<_, i64>(3)? as u64,
        created_at: ts_from_sql(4, &row.get::<_, String>(4)?)?,
        last_modified: ts_from_sql(5, &row.get::<_, String>(5)?)?,
        last_accessed: row
            .get::<_, Option<String>>(6)?
            .map(|s| ts_from_sql(6, &s))
            .transpose()?,
        access_count: row.get::<_, i64>(7)? as u64,
        owner_id: row.get(8)?,
        is_deleted: row.get(9)?,
        search_fields: json_from_sql(10, &row.get::<_, String>(10)?)?,
    })
}

/// Raw columns of one version row, before payload decoding.
struct VersionRow {
    version: u64,
    timestamp: DateTime<Utc>,
    change_summary: Option<String>,
    metadata: String,
    compression: String,
    checksum: Option<String>,
    payload: Vec<u8>,
}

fn version_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        version: row.get::<_, i64>(0)? as u64,
        timestamp: ts_from_sql(1, &row.get::<_, String>(1)?)?,
        change_summary: row.get(2)?,
        metadata: row.get(3)?,
        compression: row.get(4)?,
        checksum: row.get(5)?,
        payload: row.get(6)?,
    })
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<VersionMetadata> {
    let compression = Compression::parse(&row.get::<_, String>(6)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(VersionMetadata {
        entity_id: row.get(0)?,
        version: row.get::<_, i64>(1)? as u64,
        timestamp: ts_from_sql(2, &row.get::<_, String>(2)?)?,
        changed_fields: json_from_sql(3, &row.get::<_, String>(3)?)?,
        data_size: row.get::<_, i64>(4)? as u64,
        compressed_size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
        compression,
        checksum: row.get(7)?,
        is_full_snapshot: row.get(8)?,
    })
}

/// Backend over an embedded SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    compression: Compression,
    locks: LockTable,
}

impl SqliteBackend {
    /// Open (or create) a store in the database file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        compression: Compression,
        lock_timeout: Duration,
    ) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?, compression, lock_timeout)
    }

    /// Open with zstd compression and the default lock timeout.
    pub fn open_default(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(path, Compression::Zstd, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open a store backed by an in-memory database, lost on drop.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(
            Connection::open_in_memory()?,
            Compression::Zstd,
            DEFAULT_LOCK_TIMEOUT,
        )
    }

    fn from_connection(
        conn: Connection,
        compression: Compression,
        lock_timeout: Duration,
    ) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            compression,
            locks: LockTable::new(lock_timeout),
        })
    }

    fn load_entry(conn: &Connection, entity_id: &str) -> StoreResult<Option<IndexEntry>> {
        let sql = format!("SELECT {INDEX_COLUMNS} FROM entity_index WHERE entity_id = ?1");
        Ok(conn
            .query_row(&sql, params![entity_id], entry_from_row)
            .optional()?)
    }

    fn live_entry(conn: &Connection, entity_id: &str) -> StoreResult<IndexEntry> {
        Self::load_entry(conn, entity_id)?
            .filter(|e| !e.is_deleted)
            .ok_or_else(|| StoreError::not_found(entity_id))
    }

    fn write_entry(conn: &Connection, entry: &IndexEntry) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO entity_index (entity_id, display_name, latest_version, \
             total_versions, created_at, last_modified, last_accessed, access_count, owner_id, \
             is_deleted, search_fields) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.entity_id,
                entry.display_name,
                entry.latest_version as i64,
                entry.total_versions as i64,
                ts_to_sql(&entry.created_at),
                ts_to_sql(&entry.last_modified),
                entry.last_accessed.as_ref().map(ts_to_sql),
                entry.access_count as i64,
                entry.owner_id,
                entry.is_deleted,
                serde_json::to_string(&entry.search_fields)?,
            ],
        )?;
        Ok(())
    }

    fn insert_version(
        conn: &Connection,
        snapshot: &Snapshot,
        meta: &VersionMetadata,
        blob: &[u8],
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO entity_versions (entity_id, version, timestamp, \
             change_summary, changed_fields, data_size, compressed_size, compression, \
             checksum, is_full_snapshot, metadata, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                meta.entity_id,
                meta.version as i64,
                ts_to_sql(&meta.timestamp),
                snapshot.change_summary,
                serde_json::to_string(&meta.changed_fields)?,
                meta.data_size as i64,
                meta.compressed_size.map(|s| s as i64),
                meta.compression.as_str(),
                meta.checksum,
                meta.is_full_snapshot,
                serde_json::to_string(&snapshot.metadata)?,
                blob,
            ],
        )?;
        Ok(())
    }

    /// Rebuild a snapshot from one version row. The checksum covers
    /// the uncompressed payload bytes, which is exactly what the BLOB
    /// decodes to.
    fn snapshot_from_parts(entity_id: &str, parts: VersionRow) -> StoreResult<Snapshot> {
        let mode = Compression::parse(&parts.compression)?;
        let bytes = mode.decode(&parts.payload)?;
        if let Some(recorded) = &parts.checksum {
            verify_checksum(&bytes, recorded)?;
        }
        let payload = serde_json::from_slice(&bytes)?;
        Ok(
            Snapshot::new(entity_id, parts.version, payload, parts.timestamp)
                .with_summary(parts.change_summary)
                .with_metadata(serde_json::from_str(&parts.metadata)?),
        )
    }

    fn load_snapshot(conn: &Connection, entity_id: &str, version: u64) -> StoreResult<Snapshot> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM entity_versions \
             WHERE entity_id = ?1 AND version = ?2"
        );
        let row = conn
            .query_row(&sql, params![entity_id, version as i64], version_row)
            .optional()?;
        let parts = row.ok_or_else(|| StoreError::version_not_found(entity_id, version))?;
        Self::snapshot_from_parts(entity_id, parts)
    }

    fn load_metadata(conn: &Connection, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        let sql = format!(
            "SELECT {META_COLUMNS} FROM entity_versions WHERE entity_id = ?1 ORDER BY version"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id], meta_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl StorageBackend for SqliteBackend {
    fn save(&self, request: SaveRequest) -> StoreResult<Snapshot> {
        validate_entity_id(&request.entity_id)?;
        let _guard = self.locks.acquire(&request.entity_id)?;
        let now = Utc::now();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing = Self::load_entry(&tx, &request.entity_id)?;
        if let Some(entry) = &existing {
            if !entry.owner_matches(request.owner_id.as_deref()) {
                return Err(StoreError::PermissionDenied(request.entity_id.clone()));
            }
        }

        let version = existing.as_ref().map_or(0, |e| e.latest_version) + 1;
        let changed_fields = match &existing {
            Some(entry) => {
                let previous = Self::load_snapshot(&tx, &request.entity_id, entry.latest_version)?;
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

        let blob = self.compression.encode(&payload_bytes)?;
        let meta = VersionMetadata {
            entity_id: request.entity_id.clone(),
            version,
            timestamp: now,
            changed_fields,
            data_size: payload_bytes.len() as u64,
            compressed_size: match self.compression {
                Compression::None => None,
                _ => Some(blob.len() as u64),
            },
            compression: self.compression,
            checksum: Some(checksum),
            is_full_snapshot: true,
        };
        Self::insert_version(&tx, &snapshot, &meta, &blob)?;

        let mut entry = existing.unwrap_or_else(|| {
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
        Self::write_entry(&tx, &entry)?;
        tx.commit()?;

        Logger::log(
            Severity::Info,
            "save",
            &[
                ("backend", "sqlite"),
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
        let conn = self.conn.lock();
        let entry = Self::live_entry(&conn, entity_id)?;
        if !entry.owner_matches(owner) {
            return Err(StoreError::PermissionDenied(entity_id.to_string()));
        }

        let wanted = version.unwrap_or(entry.latest_version);
        let snapshot = Self::load_snapshot(&conn, entity_id, wanted)?;

        conn.execute(
            "UPDATE entity_index SET last_accessed = ?1, access_count = access_count + 1 \
             WHERE entity_id = ?2",
            params![ts_to_sql(&Utc::now()), entity_id],
        )?;
        Ok(snapshot)
    }

    fn history(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Snapshot>> {
        let conn = self.conn.lock();
        if Self::load_entry(&conn, entity_id)?
            .filter(|e| !e.is_deleted)
            .is_none()
        {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM entity_versions \
             WHERE entity_id = ?1 ORDER BY version DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![entity_id, limit.map_or(-1, |l| l as i64), offset as i64],
            version_row,
        )?;

        rows.map(|row| Self::snapshot_from_parts(entity_id, row?))
            .collect()
    }

    fn diff(&self, entity_id: &str, from_version: u64, to_version: u64) -> StoreResult<Diff> {
        let conn = self.conn.lock();
        Self::live_entry(&conn, entity_id)?;
        let old = Self::load_snapshot(&conn, entity_id, from_version)?;
        let new = Self::load_snapshot(&conn, entity_id, to_version)?;
        Ok(Diff::between(
            entity_id,
            from_version,
            to_version,
            &old.payload,
            &new.payload,
        ))
    }

    fn query(&self, filter: &QueryFilter) -> StoreResult<Vec<Snapshot>> {
        let conn = self.conn.lock();

        let mut sql = format!("SELECT {INDEX_COLUMNS} FROM entity_index WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if !filter.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if let Some(ids) = &filter.entity_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND entity_id IN ({placeholders})"));
            args.extend(ids.iter().cloned());
        }
        if let Some(owner) = &filter.owner_id {
            sql.push_str(" AND owner_id = ?");
            args.push(owner.clone());
        }
        if let Some(after) = &filter.modified_after {
            sql.push_str(" AND last_modified > ?");
            args.push(ts_to_sql(after));
        }
        if let Some(before) = &filter.modified_before {
            sql.push_str(" AND last_modified < ?");
            args.push(ts_to_sql(before));
        }
        sql.push_str(" ORDER BY last_modified DESC, entity_id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), entry_from_row)?;
        // Name, tag, and numeric-range criteria are evaluated in
        // process with the shared filter code. SQL LIKE folds case for
        // ASCII only, so name matching must not be pushed down.
        let entries: Vec<IndexEntry> = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();

        paginate(entries, filter.limit, filter.offset)
            .iter()
            .map(|entry| Self::load_snapshot(&conn, &entry.entity_id, entry.latest_version))
            .collect()
    }

    fn delete(&self, entity_id: &str, owner: Option<&str>, hard: bool) -> StoreResult<bool> {
        let _guard = self.locks.acquire(entity_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entry = match Self::load_entry(&tx, entity_id)? {
            None => return Ok(false),
            Some(entry) => entry,
        };
        if !entry.owner_matches(owner) {
            return Err(StoreError::PermissionDenied(entity_id.to_string()));
        }

        if hard {
            tx.execute(
                "DELETE FROM entity_versions WHERE entity_id = ?1",
                params![entity_id],
            )?;
            tx.execute(
                "DELETE FROM entity_versions_archive WHERE entity_id = ?1",
                params![entity_id],
            )?;
            tx.execute(
                "DELETE FROM entity_index WHERE entity_id = ?1",
                params![entity_id],
            )?;
        } else {
            if entry.is_deleted {
                return Ok(false);
            }
            tx.execute(
                "UPDATE entity_index SET is_deleted = 1 WHERE entity_id = ?1",
                params![entity_id],
            )?;
        }
        tx.commit()?;

        Logger::log(
            Severity::Info,
            "delete",
            &[
                ("backend", "sqlite"),
                ("entity_id", entity_id),
                ("hard", if hard { "true" } else { "false" }),
            ],
        );
        Ok(true)
    }

    fn archive(&self, before: DateTime<Utc>, keep_every_nth: u32) -> StoreResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entities: Vec<(String, u64)> = {
            let mut stmt =
                tx.prepare("SELECT entity_id, latest_version FROM entity_index")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut archived_total = 0u64;
        for (entity_id, latest_version) in entities {
            let metas = Self::load_metadata(&tx, &entity_id)?;
            let to_archive = crate::retention::select_versions_to_archive(
                &metas,
                latest_version,
                before,
                keep_every_nth,
            );
            if to_archive.is_empty() {
                continue;
            }
            for version in &to_archive {
                tx.execute(
                    "INSERT OR REPLACE INTO entity_versions_archive \
                     SELECT * FROM entity_versions WHERE entity_id = ?1 AND version = ?2",
                    params![entity_id, *version as i64],
                )?;
                tx.execute(
                    "DELETE FROM entity_versions WHERE entity_id = ?1 AND version = ?2",
                    params![entity_id, *version as i64],
                )?;
            }
            tx.execute(
                "UPDATE entity_index SET total_versions = ?1 WHERE entity_id = ?2",
                params![(metas.len() - to_archive.len()) as i64, entity_id],
            )?;
            archived_total += to_archive.len() as u64;
        }
        tx.commit()?;

        Logger::log(
            Severity::Info,
            "archive",
            &[
                ("backend", "sqlite"),
                ("archived", &archived_total.to_string()),
            ],
        );
        Ok(archived_total)
    }

    fn export(&self, entity_id: &str, include_history: bool) -> StoreResult<Vec<u8>> {
        let conn = self.conn.lock();
        let entry = Self::load_entry(&conn, entity_id)?
            .ok_or_else(|| StoreError::not_found(entity_id))?;
        let metas = Self::load_metadata(&conn, entity_id)?;
        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            let snapshot = Self::load_snapshot(&conn, entity_id, meta.version)?;
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
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entity_versions WHERE entity_id = ?1",
            params![entity_id],
        )?;
        tx.execute(
            "DELETE FROM entity_versions_archive WHERE entity_id = ?1",
            params![entity_id],
        )?;

        let mut latest: Option<Snapshot> = None;
        for (snapshot, mut meta) in records {
            meta.compression = self.compression;
            let blob = self.compression.encode(&serde_json::to_vec(&snapshot.payload)?)?;
            meta.compressed_size = match self.compression {
                Compression::None => None,
                _ => Some(blob.len() as u64),
            };
            Self::insert_version(&tx, &snapshot, &meta, &blob)?;
            latest = Some(snapshot);
        }
        let latest =
            latest.ok_or_else(|| StoreError::validation("bundle contains no snapshots"))?;

        entry.search_fields = derive_search_fields(&latest.payload);
        Self::write_entry(&tx, &entry)?;
        tx.commit()?;

        Logger::log(
            Severity::Info,
            "import",
            &[("backend", "sqlite"), ("entity_id", &entity_id)],
        );
        Ok(latest)
    }

    fn list_versions(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        let conn = self.conn.lock();
        Self::load_entry(&conn, entity_id)?.ok_or_else(|| StoreError::not_found(entity_id))?;
        Self::load_metadata(&conn, entity_id)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn.lock();
        let entity_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM entity_index", [], |r| r.get(0))?;
        let (version_count, total_data_size): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(data_size), 0) FROM entity_versions",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(StoreStats {
            entity_count: entity_count as u64,
            version_count: version_count as u64,
            total_data_size: total_data_size as u64,
        })
    }

    fn shutdown(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;
    use serde_json::json;
    use tempfile::TempDir;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn test_versions_are_contiguous() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for i in 0..3 {
            let snapshot = backend
                .save(SaveRequest::new("hero-42", payload(json!({"hp": i}))))
                .unwrap();
            assert_eq!(snapshot.version, i + 1);
        }
    }

    #[test]
    fn test_round_trip_preserves_payload() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let original = payload(json!({
            "name": "Sir Roderick",
            "hp": 12,
            "inventory": {"gold": 10, "items": ["rope", "torch"]}
        }));
        backend
            .save(SaveRequest::new("hero-42", original.clone()))
            .unwrap();
        let fetched = backend.get("hero-42", None, None).unwrap();
        assert_eq!(fetched.payload, original);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("store.db");
        {
            let backend = SqliteBackend::open_default(&db_path).unwrap();
            backend
                .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
                .unwrap();
            backend
                .save(SaveRequest::new("hero-42", payload(json!({"hp": 12}))))
                .unwrap();
            backend.shutdown().unwrap();
        }

        let backend = SqliteBackend::open_default(&db_path).unwrap();
        assert_eq!(backend.get("hero-42", None, None).unwrap().version, 2);
        let next = backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 14}))))
            .unwrap();
        assert_eq!(next.version, 3);
    }

    #[test]
    fn test_get_missing_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
            .unwrap();
        let err = backend.get("hero-42", Some(9), None).unwrap_err();
        assert!(matches!(err, StoreError::VersionNotFound { version: 9, .. }));
    }

    #[test]
    fn test_owner_enforced() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))).owner("alice"))
            .unwrap();

        assert!(backend.get("hero-42", None, Some("alice")).is_ok());
        assert!(matches!(
            backend.get("hero-42", None, Some("bob")),
            Err(StoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            backend.delete("hero-42", Some("bob"), false),
            Err(StoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_soft_delete_hides_and_revives_on_save() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
            .unwrap();
        assert!(backend.delete("hero-42", None, false).unwrap());
        assert!(backend.get("hero-42", None, None).unwrap_err().is_not_found());
        assert!(!backend.delete("hero-42", None, false).unwrap());

        // New save revives with full history intact
        let revived = backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 11}))))
            .unwrap();
        assert_eq!(revived.version, 2);
        assert_eq!(backend.history("hero-42", None, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_hard_delete_restarts_numbering() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
            .unwrap();
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 12}))))
            .unwrap();
        assert!(backend.delete("hero-42", None, true).unwrap());

        let fresh = backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 1}))))
            .unwrap();
        assert_eq!(fresh.version, 1);
    }

    #[test]
    fn test_query_pushdown_and_postfilter_agree() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(
                SaveRequest::new(
                    "hero-1",
                    payload(json!({"level": 5, "tags": ["fighter", "human"]})),
                )
                .display_name("Sir Roderick")
                .owner("alice"),
            )
            .unwrap();
        backend
            .save(
                SaveRequest::new("hero-2", payload(json!({"level": 9, "tags": ["wizard"]})))
                    .display_name("Morwenna")
                    .owner("bob"),
            )
            .unwrap();

        let by_name = QueryFilter {
            name_substrings: Some(vec!["roder".into()]),
            ..Default::default()
        };
        let results = backend.query(&by_name).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity_id, "hero-1");

        let by_tag_and_level = QueryFilter {
            tags: Some(vec!["wizard".into()]),
            numeric_range: Some(crate::backend::NumericRange {
                field: "level".into(),
                min: Some(8.0),
                max: None,
            }),
            ..Default::default()
        };
        let results = backend.query(&by_tag_and_level).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity_id, "hero-2");

        let by_owner = QueryFilter {
            owner_id: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(backend.query(&by_owner).unwrap().len(), 1);
    }

    #[test]
    fn test_name_matching_folds_unicode_case() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(
                SaveRequest::new("hero-2", payload(json!({"hp": 6})))
                    .display_name("MÖRWENNA"),
            )
            .unwrap();

        let filter = QueryFilter {
            name_substrings: Some(vec!["mör".into()]),
            ..Default::default()
        };
        let results = backend.query(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity_id, "hero-2");
    }

    #[test]
    fn test_rejects_invalid_entity_ids() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for bad in ["", "..", "a/b", "archive"] {
            let result = backend.save(SaveRequest::new(bad, payload(json!({"hp": 1}))));
            assert!(
                matches!(result, Err(StoreError::Validation(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_archive_moves_rows() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for i in 1..=10u64 {
            backend
                .save(SaveRequest::new("hero-42", payload(json!({"hp": i}))))
                .unwrap();
        }

        let archived = backend.archive(Utc::now(), 3).unwrap();
        assert_eq!(archived, 6);
        assert_eq!(backend.list_versions("hero-42").unwrap().len(), 4);
        assert_eq!(backend.get("hero-42", None, None).unwrap().version, 10);

        let conn = backend.conn.lock();
        let archived_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entity_versions_archive WHERE entity_id = 'hero-42'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(archived_rows, 6);
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = SqliteBackend::open_in_memory().unwrap();
        source
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
            .unwrap();
        source
            .save(SaveRequest::new("hero-42", payload(json!({"hp": 12}))))
            .unwrap();

        let bytes = source.export("hero-42", true).unwrap();
        let target = SqliteBackend::open_in_memory().unwrap();
        let latest = target.import(&bytes).unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(target.history("hero-42", None, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_stats_counts() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .save(SaveRequest::new("hero-1", payload(json!({"hp": 1}))))
            .unwrap();
        backend
            .save(SaveRequest::new("hero-1", payload(json!({"hp": 2}))))
            .unwrap();
        backend
            .save(SaveRequest::new("hero-2", payload(json!({"hp": 3}))))
            .unwrap();

        let stats = backend.stats().unwrap();
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.version_count, 3);
        assert!(stats.total_data_size > 0);
    }
}
