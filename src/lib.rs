//! vellum - a schema-tolerant, versioned entity document store
//!
//! Entities are opaque JSON trees saved as immutable, contiguously
//! numbered versions. Three interchangeable backends (in-memory, file
//! tree, embedded SQLite) implement one [`backend::StorageBackend`]
//! contract; structural diffs, filtered queries, retention/archival,
//! and export/import behave identically on all of them.

pub mod backend;
pub mod compress;
pub mod diff;
pub mod errors;
pub mod factory;
pub mod locks;
pub mod model;
pub mod observability;
pub mod retention;

pub use backend::{
    ExportBundle, FileBackend, MemoryBackend, NumericRange, QueryFilter, SaveRequest,
    SqliteBackend, StorageBackend, StoreStats,
};
pub use compress::Compression;
pub use diff::Diff;
pub use errors::{StoreError, StoreResult};
pub use factory::{BackendKind, CacheConfig, StorageConfig, StorageFactory};
pub use model::{IndexEntry, Payload, RetentionPolicy, Snapshot, VersionMetadata};
pub use retention::RetentionManager;
