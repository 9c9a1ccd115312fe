//! Structural diff between payload trees
//!
//! Pure and backend-independent: every backend's `diff` operation is a
//! payload fetch followed by [`diff_payloads`].
//!
//! The walk visits the union of keys at each map level. A key present
//! on only one side becomes a leaf change against `Null`. When both
//! sides hold unequal maps the walk recurses with a dot-extended path.
//! Anything else that differs — including arrays — is recorded as a
//! single leaf change; arrays are never compared element-wise.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Payload;

/// Field-level changes between two versions of an entity.
///
/// `changes` maps a dot-joined field path to `(old, new)`. A side on
/// which the field is absent is represented as `Value::Null`. Path
/// ordering is not guaranteed; callers must treat the set as unordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// Entity the diff applies to
    pub entity_id: String,
    /// Older version number
    pub from_version: u64,
    /// Newer version number
    pub to_version: u64,
    /// Field path -> (old value, new value)
    pub changes: HashMap<String, (Value, Value)>,
}

impl Diff {
    /// Compute the diff between two payloads of the same entity.
    pub fn between(
        entity_id: impl Into<String>,
        from_version: u64,
        to_version: u64,
        old: &Payload,
        new: &Payload,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            from_version,
            to_version,
            changes: diff_payloads(old, new),
        }
    }

    /// Returns true when the two versions are structurally identical.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Sorted list of changed field paths, for deterministic storage
    /// in `VersionMetadata.changed_fields`.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.changes.keys().cloned().collect();
        fields.sort();
        fields
    }
}

/// Compute the structural differences between two payload trees.
pub fn diff_payloads(old: &Payload, new: &Payload) -> HashMap<String, (Value, Value)> {
    let mut changes = HashMap::new();
    diff_maps(old, new, "", &mut changes);
    changes
}

fn diff_maps(
    old: &Payload,
    new: &Payload,
    prefix: &str,
    changes: &mut HashMap<String, (Value, Value)>,
) {
    for (key, old_value) in old {
        let path = join_path(prefix, key);
        match new.get(key) {
            None => {
                changes.insert(path, (old_value.clone(), Value::Null));
            }
            Some(new_value) => {
                diff_values(old_value, new_value, &path, changes);
            }
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            changes.insert(join_path(prefix, key), (Value::Null, new_value.clone()));
        }
    }
}

fn diff_values(
    old: &Value,
    new: &Value,
    path: &str,
    changes: &mut HashMap<String, (Value, Value)>,
) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            diff_maps(old_map, new_map, path, changes);
        }
        // Arrays (and every other unequal pair) are leaf changes.
        _ => {
            changes.insert(path.to_string(), (old.clone(), new.clone()));
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
