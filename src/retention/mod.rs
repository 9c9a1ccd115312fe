//! Retention and archival
//!
//! `Archive` is a pruning operation, not a backup: archived versions
//! leave active storage and are not guaranteed to remain reachable
//! through `Get`/`History`. The latest version of every entity is
//! never archived.
//!
//! Candidate selection is shared by every backend through
//! [`select_versions_to_archive`] so the sampling behavior cannot
//! drift between implementations.

use chrono::{DateTime, Duration, Utc};

use crate::backend::StorageBackend;
use crate::errors::StoreResult;
use crate::model::{RetentionPolicy, VersionMetadata};
use crate::observability::{Logger, Severity};

/// Pick the versions of one entity to move into the archive area.
///
/// Candidates are versions strictly older than `before`, excluding the
/// current latest, taken in ascending version order. Every Nth
/// candidate (the first, then each `keep_every_nth` later) is kept;
/// the rest are archived. `keep_every_nth <= 1` keeps every candidate,
/// making the call a no-op.
pub fn select_versions_to_archive(
    versions: &[VersionMetadata],
    latest_version: u64,
    before: DateTime<Utc>,
    keep_every_nth: u32,
) -> Vec<u64> {
    if keep_every_nth <= 1 {
        return Vec::new();
    }
    let mut candidates: Vec<&VersionMetadata> = versions
        .iter()
        .filter(|m| m.version != latest_version && m.timestamp < before)
        .collect();
    candidates.sort_by_key(|m| m.version);

    candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| i % keep_every_nth as usize != 0)
        .map(|(_, m)| m.version)
        .collect()
}

/// Applies a retention policy to a backend.
pub struct RetentionManager {
    policy: RetentionPolicy,
}

impl RetentionManager {
    /// Create a manager for the given policy.
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Cutoff before which versions become archive candidates.
    pub fn archive_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.policy.keep_all_for_days))
    }

    /// Run one archival pass against a backend.
    ///
    /// Returns the number of versions moved to the archive area.
    pub fn run(&self, backend: &dyn StorageBackend, now: DateTime<Utc>) -> StoreResult<u64> {
        let cutoff = self.archive_cutoff(now);
        let archived = backend.archive(cutoff, self.policy.keep_every_nth)?;
        Logger::log(
            Severity::Info,
            "retention_run",
            &[
                ("archived", &archived.to_string()),
                ("cutoff", &cutoff.to_rfc3339()),
            ],
        );
        Ok(archived)
    }
}
