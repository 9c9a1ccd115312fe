//! Data model for the versioned store
//!
//! Payloads are opaque, schema-free JSON trees. Everything else in this
//! module is bookkeeping around them: immutable per-version snapshots,
//! the denormalized index entry mutated as versions arrive, and the
//! per-version metadata records the retention machinery works from.

mod index;
mod metadata;
mod snapshot;

pub use index::IndexEntry;
pub use metadata::VersionMetadata;
pub use snapshot::Snapshot;

use serde_json::Value;

/// An entity payload: an ordered map from string key to JSON value.
///
/// Opaque beyond structural comparison; no fixed schema. Unknown fields
/// are preserved verbatim across save/load round trips.
pub type Payload = serde_json::Map<String, Value>;

/// Retention windows applied by the retention manager.
///
/// The tiered windows (`keep_daily_for_days` etc.) are carried for
/// callers that schedule tiered archival runs; `Archive` itself takes a
/// cutoff plus the `keep_every_nth` sampling parameter.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetentionPolicy {
    /// Versions newer than this many days are never archived.
    pub keep_all_for_days: u32,
    /// Window for keeping roughly one version per day.
    pub keep_daily_for_days: u32,
    /// Window for keeping roughly one version per week.
    pub keep_weekly_for_days: u32,
    /// Whether one version per month is kept indefinitely.
    pub keep_monthly_forever: bool,
    /// Sampling parameter for `Archive`: of the versions older than the
    /// cutoff (latest always excluded), every Nth is kept.
    pub keep_every_nth: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_all_for_days: 30,
            keep_daily_for_days: 90,
            keep_weekly_for_days: 365,
            keep_monthly_forever: true,
            keep_every_nth: 1,
        }
    }
}
