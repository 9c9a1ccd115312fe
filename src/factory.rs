//! Backend selection and configuration
//!
//! One declarative [`StorageConfig`] (deserializable from JSON config
//! files) names the backend, compression mode, lock timeout, and an
//! optional read cache. [`StorageFactory::open`] turns it into a boxed
//! [`StorageBackend`]; callers hold the trait object and never depend
//! on a concrete backend type.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{
    FileBackend, MemoryBackend, QueryFilter, SaveRequest, SqliteBackend, StorageBackend,
    StoreStats,
};
use crate::compress::Compression;
use crate::diff::Diff;
use crate::errors::{StoreError, StoreResult};
use crate::model::{Snapshot, VersionMetadata};

fn default_lock_timeout_secs() -> u64 {
    5
}

fn default_cache_capacity() -> usize {
    256
}

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process maps, lost on drop
    Memory,
    /// Directory tree of JSON files
    File {
        /// Storage root directory
        root: PathBuf,
    },
    /// Embedded SQLite database
    Sqlite {
        /// Database file path
        path: PathBuf,
    },
}

/// Read-cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached snapshots
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

/// Complete store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend to open
    pub backend: BackendKind,
    /// Compression for stored version payloads
    #[serde(default)]
    pub compression: Compression,
    /// Bound on per-entity lock acquisition, in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Latest-snapshot read cache; absent means no caching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

impl StorageConfig {
    /// Configuration for an in-memory store.
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            compression: Compression::None,
            lock_timeout_secs: default_lock_timeout_secs(),
            cache: None,
        }
    }

    /// Configuration for a file store rooted at `root`.
    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::File { root: root.into() },
            compression: Compression::Gzip,
            lock_timeout_secs: default_lock_timeout_secs(),
            cache: None,
        }
    }

    /// Configuration for a SQLite store at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sqlite { path: path.into() },
            compression: Compression::Zstd,
            lock_timeout_secs: default_lock_timeout_secs(),
            cache: None,
        }
    }

    /// Enable the read cache.
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = Some(CacheConfig { capacity });
        self
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Opens backends from configuration.
pub struct StorageFactory;

impl StorageFactory {
    /// Open the backend a configuration describes.
    pub fn open(config: StorageConfig) -> StoreResult<Box<dyn StorageBackend>> {
        let timeout = config.lock_timeout();
        let backend: Box<dyn StorageBackend> = match &config.backend {
            BackendKind::Memory => Box::new(MemoryBackend::with_lock_timeout(timeout)),
            BackendKind::File { root } => {
                Box::new(FileBackend::open(root, config.compression, timeout)?)
            }
            BackendKind::Sqlite { path } => {
                Box::new(SqliteBackend::open(path, config.compression, timeout)?)
            }
        };
        Ok(match config.cache {
            Some(cache) => Box::new(CachedBackend::new(backend, cache.capacity)),
            None => backend,
        })
    }
}

/// Cache key: entity plus the caller identity the snapshot was fetched
/// with, so a cached hit can never leak past an owner check.
type CacheKey = (String, Option<String>);

struct CacheState {
    map: HashMap<CacheKey, Snapshot>,
    order: VecDeque<CacheKey>,
}

/// Latest-snapshot read cache over any backend.
///
/// Only latest reads (`version: None`) are served from cache; any write
/// path invalidates the entity. Cache hits do not reach the inner
/// backend, so access statistics count cache misses only.
pub struct CachedBackend {
    inner: Box<dyn StorageBackend>,
    capacity: usize,
    cache: Mutex<CacheState>,
}

impl CachedBackend {
    /// Wrap a backend with a cache of the given capacity.
    pub fn new(inner: Box<dyn StorageBackend>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(CacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn insert(&self, key: CacheKey, snapshot: Snapshot) {
        let mut cache = self.cache.lock();
        if !cache.map.contains_key(&key) {
            while cache.order.len() >= self.capacity {
                if let Some(evicted) = cache.order.pop_front() {
                    cache.map.remove(&evicted);
                }
            }
            cache.order.push_back(key.clone());
        }
        cache.map.insert(key, snapshot);
    }

    fn invalidate(&self, entity_id: &str) {
        let mut cache = self.cache.lock();
        cache.map.retain(|(id, _), _| id != entity_id);
        cache.order.retain(|(id, _)| id != entity_id);
    }

    fn invalidate_all(&self) {
        let mut cache = self.cache.lock();
        cache.map.clear();
        cache.order.clear();
    }
}

impl StorageBackend for CachedBackend {
    fn save(&self, request: SaveRequest) -> StoreResult<Snapshot> {
        let snapshot = self.inner.save(request)?;
        self.invalidate(&snapshot.entity_id);
        Ok(snapshot)
    }

    fn get(
        &self,
        entity_id: &str,
        version: Option<u64>,
        owner: Option<&str>,
    ) -> StoreResult<Snapshot> {
        if version.is_some() {
            // Past versions are immutable but rarely re-read; only the
            // latest is worth caching.
            return self.inner.get(entity_id, version, owner);
        }
        let key: CacheKey = (entity_id.to_string(), owner.map(str::to_string));
        if let Some(snapshot) = self.cache.lock().map.get(&key) {
            return Ok(snapshot.clone());
        }
        let snapshot = self.inner.get(entity_id, None, owner)?;
        self.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    fn history(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Snapshot>> {
        self.inner.history(entity_id, limit, offset)
    }

    fn diff(&self, entity_id: &str, from_version: u64, to_version: u64) -> StoreResult<Diff> {
        self.inner.diff(entity_id, from_version, to_version)
    }

    fn query(&self, filter: &QueryFilter) -> StoreResult<Vec<Snapshot>> {
        self.inner.query(filter)
    }

    fn delete(&self, entity_id: &str, owner: Option<&str>, hard: bool) -> StoreResult<bool> {
        let deleted = self.inner.delete(entity_id, owner, hard)?;
        if deleted {
            self.invalidate(entity_id);
        }
        Ok(deleted)
    }

    fn archive(&self, before: DateTime<Utc>, keep_every_nth: u32) -> StoreResult<u64> {
        // Archival never touches latest versions, but dropping the
        // whole cache keeps the invariant obvious.
        let archived = self.inner.archive(before, keep_every_nth)?;
        self.invalidate_all();
        Ok(archived)
    }

    fn export(&self, entity_id: &str, include_history: bool) -> StoreResult<Vec<u8>> {
        self.inner.export(entity_id, include_history)
    }

    fn import(&self, bytes: &[u8]) -> StoreResult<Snapshot> {
        let snapshot = self.inner.import(bytes)?;
        self.invalidate(&snapshot.entity_id);
        Ok(snapshot)
    }

    fn list_versions(&self, entity_id: &str) -> StoreResult<Vec<VersionMetadata>> {
        self.inner.list_versions(entity_id)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats()
    }

    fn shutdown(&self) -> StoreResult<()> {
        self.invalidate_all();
        self.inner.shutdown()
    }
}
