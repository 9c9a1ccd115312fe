//! Version history invariant tests
//!
//! Core guarantees of the store, exercised through the public API:
//! contiguous version numbering, immutability of past versions,
//! diff correctness, and soft-delete semantics.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use vellum::{MemoryBackend, Payload, QueryFilter, SaveRequest, StorageBackend, StoreError};

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("test payload must be an object"),
    }
}

// =========================================================================
// Versioning
// =========================================================================

/// Versions are assigned contiguously from 1, in save order.
#[test]
fn test_versions_contiguous_from_one() {
    let backend = MemoryBackend::new();
    for expected in 1..=5u64 {
        let snapshot = backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": expected}))))
            .unwrap();
        assert_eq!(snapshot.version, expected);
    }

    let history = backend.history("hero-42", None, 0).unwrap();
    let versions: Vec<u64> = history.iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![5, 4, 3, 2, 1]);
}

/// Saving never mutates previously stored versions.
#[test]
fn test_past_versions_immutable() {
    let backend = MemoryBackend::new();
    let original = payload(json!({"hp": 10, "inventory": {"gold": 5}}));
    backend
        .save(SaveRequest::new("hero-42", original.clone()))
        .unwrap();
    backend
        .save(SaveRequest::new(
            "hero-42",
            payload(json!({"hp": 99, "inventory": {"gold": 0}})),
        ))
        .unwrap();

    let v1 = backend.get("hero-42", Some(1), None).unwrap();
    assert_eq!(v1.payload, original);
}

/// Unknown payload fields survive a save/load round trip verbatim.
#[test]
fn test_schema_tolerance_round_trip() {
    let backend = MemoryBackend::new();
    let exotic = payload(json!({
        "hp": 10,
        "homebrew_rules": {"critfumble": true, "tables": [1, 2, 3]},
        "注釈": "non-ascii keys too",
        "deep": {"a": {"b": {"c": {"d": null}}}}
    }));
    backend
        .save(SaveRequest::new("hero-42", exotic.clone()))
        .unwrap();
    assert_eq!(backend.get("hero-42", None, None).unwrap().payload, exotic);
}

/// Requesting a version that was never written fails cleanly.
#[test]
fn test_missing_version_is_an_error() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
        .unwrap();

    let err = backend.get("hero-42", Some(2), None).unwrap_err();
    assert!(matches!(err, StoreError::VersionNotFound { version: 2, .. }));

    let err = backend.get("nobody", None, None).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

// =========================================================================
// Diffs
// =========================================================================

/// The three-save scenario: hp changes, ac appears, and the diff from
/// v1 to v3 reports exactly those two fields.
#[test]
fn test_three_save_scenario() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new("42", payload(json!({"hp": 10}))))
        .unwrap();
    backend
        .save(SaveRequest::new("42", payload(json!({"hp": 12}))))
        .unwrap();
    backend
        .save(SaveRequest::new("42", payload(json!({"hp": 12, "ac": 15}))))
        .unwrap();

    let latest = backend.get("42", None, None).unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(latest.payload, payload(json!({"hp": 12, "ac": 15})));

    let diff = backend.diff("42", 1, 3).unwrap();
    assert_eq!(diff.changes.len(), 2);
    assert_eq!(diff.changes["hp"], (json!(10), json!(12)));
    assert_eq!(diff.changes["ac"], (Value::Null, json!(15)));

    let recent = backend.history("42", Some(2), 0).unwrap();
    let versions: Vec<u64> = recent.iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![3, 2]);
}

/// Diffing a version against itself is empty.
#[test]
fn test_diff_identity_is_empty() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new(
            "hero-42",
            payload(json!({"hp": 10, "stats": {"str": 14}})),
        ))
        .unwrap();
    assert!(backend.diff("hero-42", 1, 1).unwrap().is_empty());
}

/// Collect the leaf paths whose values differ, by a recursive walk
/// written separately from the diff engine: union of keys per level,
/// recurse only when both sides hold unequal maps, everything else
/// that differs is a leaf.
fn differing_leaf_paths(
    prefix: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    out: &mut BTreeSet<String>,
) {
    let mut keys: BTreeSet<&String> = old.keys().collect();
    keys.extend(new.keys());
    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match (old.get(key.as_str()), new.get(key.as_str())) {
            (Some(Value::Object(a)), Some(Value::Object(b))) if a != b => {
                differing_leaf_paths(&path, a, b, out);
            }
            (a, b) => {
                if a != b {
                    out.insert(path);
                }
            }
        }
    }
}

/// The diff's key set equals exactly the differing leaf paths found by
/// the independent walk, on a fixture covering additions, removals,
/// scalar changes, nested changes, and opaque array changes.
#[test]
fn test_diff_complete_against_independent_walk() {
    let before = payload(json!({
        "hp": 10,
        "ac": 14,
        "notes": "unchanged",
        "stats": {"str": 14, "dex": 12, "skills": {"stealth": 2}},
        "spells": ["shield"]
    }));
    let after = payload(json!({
        "hp": 12,
        "notes": "unchanged",
        "stats": {"str": 14, "dex": 13, "skills": {"stealth": 3, "arcana": 1}},
        "spells": ["shield", "mage armor"],
        "xp": 300
    }));

    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new("hero-42", before.clone()))
        .unwrap();
    backend
        .save(SaveRequest::new("hero-42", after.clone()))
        .unwrap();
    let diff = backend.diff("hero-42", 1, 2).unwrap();

    let mut expected = BTreeSet::new();
    differing_leaf_paths("", &before, &after, &mut expected);
    let actual: BTreeSet<String> = diff.changes.keys().cloned().collect();

    assert_eq!(actual, expected);
    // The fixture exercises every change kind
    assert!(expected.contains("hp"));
    assert!(expected.contains("ac"));
    assert!(expected.contains("xp"));
    assert!(expected.contains("stats.dex"));
    assert!(expected.contains("stats.skills.stealth"));
    assert!(expected.contains("stats.skills.arcana"));
    assert!(expected.contains("spells"));
    assert!(!expected.contains("notes"));
    assert!(!expected.contains("stats.str"));
}

/// Changed-field metadata matches what a direct diff reports.
#[test]
fn test_changed_fields_recorded_per_version() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new(
            "hero-42",
            payload(json!({"hp": 10, "stats": {"str": 14}})),
        ))
        .unwrap();
    backend
        .save(SaveRequest::new(
            "hero-42",
            payload(json!({"hp": 12, "stats": {"str": 14}})),
        ))
        .unwrap();

    let versions = backend.list_versions("hero-42").unwrap();
    assert_eq!(versions.len(), 2);
    // Version 1 has no predecessor
    assert!(versions[0].changed_fields.is_empty());
    assert_eq!(versions[1].changed_fields, vec!["hp".to_string()]);
}

// =========================================================================
// Deletion
// =========================================================================

/// Soft delete hides the entity from reads but keeps its history, and
/// a later save revives it with numbering intact.
#[test]
fn test_soft_delete_hides_then_save_revives() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))))
        .unwrap();
    backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 12}))))
        .unwrap();

    assert!(backend.delete("hero-42", None, false).unwrap());
    assert!(backend.get("hero-42", None, None).unwrap_err().is_not_found());
    assert!(backend.query(&QueryFilter::default()).unwrap().is_empty());

    // Visible again when explicitly requested
    let filter = QueryFilter {
        include_deleted: true,
        ..Default::default()
    };
    assert_eq!(backend.query(&filter).unwrap().len(), 1);

    let revived = backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 13}))))
        .unwrap();
    assert_eq!(revived.version, 3);
    assert_eq!(backend.history("hero-42", None, 0).unwrap().len(), 3);
}

/// Hard delete is irreversible; a re-created entity starts over at
/// version 1 with no memory of its past.
#[test]
fn test_hard_delete_resets_entity() {
    let backend = MemoryBackend::new();
    for hp in [10, 12, 14] {
        backend
            .save(SaveRequest::new("hero-42", payload(json!({"hp": hp}))))
            .unwrap();
    }
    assert!(backend.delete("hero-42", None, true).unwrap());
    assert!(!backend.delete("hero-42", None, true).unwrap());

    let fresh = backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 1}))))
        .unwrap();
    assert_eq!(fresh.version, 1);
    assert_eq!(backend.history("hero-42", None, 0).unwrap().len(), 1);
}

// =========================================================================
// Ownership
// =========================================================================

/// The owner recorded at creation gates reads, writes, and deletes.
#[test]
fn test_owner_gates_all_operations() {
    let backend = MemoryBackend::new();
    backend
        .save(SaveRequest::new("hero-42", payload(json!({"hp": 10}))).owner("alice"))
        .unwrap();

    assert!(backend.get("hero-42", None, Some("alice")).is_ok());
    assert!(matches!(
        backend.get("hero-42", None, Some("bob")),
        Err(StoreError::PermissionDenied(_))
    ));
    assert!(matches!(
        backend.save(SaveRequest::new("hero-42", payload(json!({"hp": 1}))).owner("bob")),
        Err(StoreError::PermissionDenied(_))
    ));
    assert!(matches!(
        backend.delete("hero-42", Some("bob"), true),
        Err(StoreError::PermissionDenied(_))
    ));

    // Ownerless entities remain open to everyone
    backend
        .save(SaveRequest::new("npc-1", payload(json!({"hp": 4}))))
        .unwrap();
    assert!(backend.get("npc-1", None, Some("bob")).is_ok());
}
