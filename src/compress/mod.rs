//! Payload compression and checksums
//!
//! Each stored version is compressed independently so a single corrupt
//! file can never take out more than one version. Checksums are CRC32
//! (IEEE polynomial) over the uncompressed payload bytes, formatted as
//! `crc32:XXXXXXXX`.

use std::io::{Read, Write};

use crc32fast::Hasher;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// zstd compression level used for version payloads
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to stored payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Store bytes verbatim
    #[default]
    None,
    /// gzip (flate2)
    Gzip,
    /// zstd, level 3
    Zstd,
}

impl Compression {
    /// File extension suffix for version files (`""`, `".gz"`, `".zst"`).
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    /// Stable string name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// Parse the stable string name.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(StoreError::storage(format!(
                "unknown compression mode: {other}"
            ))),
        }
    }

    /// Compress payload bytes.
    pub fn encode(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| StoreError::io("gzip encode", e))
            }
            Compression::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| StoreError::io("zstd encode", e)),
        }
    }

    /// Decompress stored bytes.
    pub fn decode(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| StoreError::io("gzip decode", e))?;
                Ok(out)
            }
            Compression::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| StoreError::io("zstd decode", e)),
        }
    }
}

/// Computes a CRC32 checksum over the provided data.
///
/// Deterministic: the same input always produces the same output.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Formats a CRC32 checksum as `crc32:XXXXXXXX` (lowercase hex,
/// zero-padded).
pub fn format_checksum(checksum: u32) -> String {
    format!("crc32:{:08x}", checksum)
}

/// Parses a formatted checksum string back to u32.
///
/// Returns `None` if the format is invalid.
pub fn parse_checksum(formatted: &str) -> Option<u32> {
    let stripped = formatted.strip_prefix("crc32:")?;
    u32::from_str_radix(stripped, 16).ok()
}

/// Verifies uncompressed payload bytes against a recorded checksum.
pub fn verify_checksum(data: &[u8], recorded: &str) -> StoreResult<()> {
    let expected = parse_checksum(recorded)
        .ok_or_else(|| StoreError::storage(format!("malformed checksum: {recorded}")))?;
    let actual = compute_checksum(data);
    if actual != expected {
        return Err(StoreError::storage(format!(
            "checksum mismatch: recorded {recorded}, computed {}",
            format_checksum(actual)
        )));
    }
    Ok(())
}
