//! Per-version metadata record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compress::Compression;

/// Bookkeeping for one stored version, kept beside the payload.
///
/// This is the surface the retention manager and callers inspect
/// without decompressing payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    /// Entity identifier
    pub entity_id: String,

    /// Version number
    pub version: u64,

    /// When the version was saved
    pub timestamp: DateTime<Utc>,

    /// Dot-joined paths of fields that changed relative to the
    /// previous version; empty for version 1
    #[serde(default)]
    pub changed_fields: Vec<String>,

    /// Size of the uncompressed payload JSON in bytes
    pub data_size: u64,

    /// Size of the stored bytes when compression is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,

    /// Compression applied to the stored payload
    pub compression: Compression,

    /// Checksum of the uncompressed payload bytes (`crc32:%08x`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Whether this record holds the complete payload (always true;
    /// carried for forward compatibility with delta storage)
    #[serde(default = "default_true")]
    pub is_full_snapshot: bool,
}

fn default_true() -> bool {
    true
}
