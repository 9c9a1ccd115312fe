//! On-disk layout and write primitives
//!
//! ```text
//! root/
//!   index.json                    all IndexEntry records
//!   {entity_id}/
//!     latest.json                 current snapshot, uncompressed
//!     metadata.json               VersionMetadata per active version
//!     versions/v{N}.json[.gz|.zst]
//!   archive/
//!     {entity_id}/
//!       metadata.json             VersionMetadata per archived version
//!       v{N}.json[.gz|.zst]
//! ```
//!
//! Every JSON file is written through a temp-file-then-atomic-rename
//! sequence with fsync, so a crash can never leave a partially written
//! file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::compress::Compression;
use crate::errors::{StoreError, StoreResult};

/// Name of the root index file
pub const INDEX_FILE: &str = "index.json";
/// Name of the archive directory under the root
pub const ARCHIVE_DIR: &str = "archive";
/// Name of the per-entity fast-path snapshot
pub const LATEST_FILE: &str = "latest.json";
/// Name of the per-entity metadata file
pub const METADATA_FILE: &str = "metadata.json";
/// Name of the per-entity versions directory
pub const VERSIONS_DIR: &str = "versions";

/// Path helpers rooted at one storage directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout over the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/index.json`
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// `root/{entity_id}/`
    pub fn entity_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(entity_id)
    }

    /// `root/{entity_id}/latest.json`
    pub fn latest_path(&self, entity_id: &str) -> PathBuf {
        self.entity_dir(entity_id).join(LATEST_FILE)
    }

    /// `root/{entity_id}/metadata.json`
    pub fn metadata_path(&self, entity_id: &str) -> PathBuf {
        self.entity_dir(entity_id).join(METADATA_FILE)
    }

    /// `root/{entity_id}/versions/`
    pub fn versions_dir(&self, entity_id: &str) -> PathBuf {
        self.entity_dir(entity_id).join(VERSIONS_DIR)
    }

    /// `root/{entity_id}/versions/v{N}.json[.gz|.zst]`
    pub fn version_path(&self, entity_id: &str, version: u64, compression: Compression) -> PathBuf {
        self.versions_dir(entity_id)
            .join(format!("v{}.json{}", version, compression.extension()))
    }

    /// `root/archive/{entity_id}/`
    pub fn archive_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join(entity_id)
    }

    /// `root/archive/{entity_id}/metadata.json`
    pub fn archive_metadata_path(&self, entity_id: &str) -> PathBuf {
        self.archive_dir(entity_id).join(METADATA_FILE)
    }

    /// `root/archive/{entity_id}/v{N}.json[.gz|.zst]`
    pub fn archive_version_path(
        &self,
        entity_id: &str,
        version: u64,
        compression: Compression,
    ) -> PathBuf {
        self.archive_dir(entity_id)
            .join(format!("v{}.json{}", version, compression.extension()))
    }
}

/// Create a directory (and parents) if missing.
pub fn ensure_dir(path: &Path) -> StoreResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| StoreError::io(format!("create directory {}", path.display()), e))?;
    }
    Ok(())
}

/// Write bytes to `path` via temp file, fsync, then atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::storage(format!("no parent directory: {}", path.display())))?;
    ensure_dir(parent)?;

    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)
        .map_err(|e| StoreError::io(format!("create {}", tmp_path.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| StoreError::io(format!("write {}", tmp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| StoreError::io(format!("fsync {}", tmp_path.display()), e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        // Leave no temp file behind on a failed rename
        let _ = fs::remove_file(&tmp_path);
        StoreError::io(
            format!("rename {} -> {}", tmp_path.display(), path.display()),
            e,
        )
    })
}

/// Serialize a value as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::storage(format!("serialize {}: {e}", path.display())))?;
    write_atomic(path, &bytes)
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let bytes =
        fs::read(path).map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::storage(format!("corrupt JSON in {}: {e}", path.display())))
}

/// Read a JSON file, returning the type's default when absent.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_json(path)
}
