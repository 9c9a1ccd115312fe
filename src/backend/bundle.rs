//! Export/import bundle format
//!
//! One JSON document per entity, shared by all backends so a bundle
//! exported from one backend imports into any other. Import replaces
//! whatever state the target store holds for that entity.

use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};
use crate::model::{IndexEntry, Snapshot, VersionMetadata};

/// Bundle format version
const FORMAT_VERSION: u8 = 1;

/// Serialized form of one entity: its index entry plus version records
/// in ascending version order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    /// Format version, always 1
    pub format_version: u8,
    /// The entity's index entry at export time
    pub entry: IndexEntry,
    /// Snapshots, ascending by version; just the latest when the
    /// export excluded history
    pub snapshots: Vec<Snapshot>,
    /// Version metadata aligned with `snapshots`
    pub versions: Vec<VersionMetadata>,
}

impl ExportBundle {
    /// Build a bundle from an entity's records.
    ///
    /// `records` must be ascending by version; only the last element is
    /// kept when `include_history` is false.
    pub fn new(
        entry: IndexEntry,
        mut records: Vec<(Snapshot, VersionMetadata)>,
        include_history: bool,
    ) -> Self {
        if !include_history && records.len() > 1 {
            records.drain(..records.len() - 1);
        }
        let (snapshots, versions) = records.into_iter().unzip();
        Self {
            format_version: FORMAT_VERSION,
            entry,
            snapshots,
            versions,
        }
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(StoreError::from)
    }

    /// Parse and validate a bundle from the wire format.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let bundle: ExportBundle = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::validation(format!("malformed export bundle: {e}")))?;
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(StoreError::validation(format!(
                "unsupported bundle format version {}",
                self.format_version
            )));
        }
        if self.snapshots.is_empty() {
            return Err(StoreError::validation("bundle contains no snapshots"));
        }
        if self.snapshots.len() != self.versions.len() {
            return Err(StoreError::validation(
                "bundle snapshot and metadata counts differ",
            ));
        }
        let entity_id = &self.entry.entity_id;
        if entity_id.is_empty() {
            return Err(StoreError::validation("bundle entity_id is empty"));
        }
        let mut previous = 0u64;
        for (snapshot, meta) in self.snapshots.iter().zip(&self.versions) {
            if &snapshot.entity_id != entity_id || &meta.entity_id != entity_id {
                return Err(StoreError::validation(
                    "bundle mixes records from different entities",
                ));
            }
            if snapshot.version != meta.version {
                return Err(StoreError::validation(
                    "bundle snapshot and metadata versions misaligned",
                ));
            }
            if snapshot.version <= previous {
                return Err(StoreError::validation(
                    "bundle versions are not strictly ascending",
                ));
            }
            previous = snapshot.version;
        }
        Ok(())
    }

    /// Rewrite the bundle's records into contiguous versions 1..N.
    ///
    /// A latest-only export carries a single record whose original
    /// version may be arbitrary; imported state must still satisfy the
    /// contiguous-from-1 invariant.
    pub fn into_normalized(self) -> (IndexEntry, Vec<(Snapshot, VersionMetadata)>) {
        let mut entry = self.entry;
        let mut records: Vec<(Snapshot, VersionMetadata)> = self
            .snapshots
            .into_iter()
            .zip(self.versions)
            .collect();
        for (i, (snapshot, meta)) in records.iter_mut().enumerate() {
            let version = (i + 1) as u64;
            snapshot.version = version;
            meta.version = version;
        }
        entry.latest_version = records.len() as u64;
        entry.total_versions = records.len() as u64;
        (entry, records)
    }
}
