//! Per-entity write serialization
//!
//! `Save` and `Delete` hold the owning entity's exclusive lock so that
//! version-number assignment and index mutation are serialized per
//! entity. Operations on different entities proceed concurrently, and
//! reads of immutable past versions never touch this table.
//!
//! Acquisition is bounded: exceeding the configured timeout surfaces
//! `StoreError::Concurrency` instead of blocking indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::errors::{StoreError, StoreResult};

/// Guard proving the holder owns an entity's write lock.
pub type EntityLockGuard = ArcMutexGuard<RawMutex, ()>;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Table of per-entity exclusive locks.
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl LockTable {
    /// Create a lock table with the given acquisition timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the exclusive lock for one entity.
    ///
    /// Blocks up to the configured timeout, then fails with
    /// `StoreError::Concurrency`.
    pub fn acquire(&self, entity_id: &str) -> StoreResult<EntityLockGuard> {
        let lock = {
            let mut table = self.locks.lock();
            table
                .entry(entity_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_arc_for(self.timeout)
            .ok_or_else(|| StoreError::Concurrency(entity_id.to_string()))
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}
