//! Backend equivalence tests
//!
//! The same operation sequence is run against every backend and the
//! observable results are compared pairwise. Backends may differ in
//! persistence and performance, never in behavior.

use serde_json::{json, Value};
use tempfile::TempDir;
use vellum::{
    Compression, FileBackend, MemoryBackend, Payload, QueryFilter, SaveRequest, SqliteBackend,
    StorageBackend,
};

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("test payload must be an object"),
    }
}

struct Harness {
    label: &'static str,
    backend: Box<dyn StorageBackend>,
    _dir: TempDir,
}

fn all_backends() -> Vec<Harness> {
    let memory_dir = TempDir::new().unwrap();
    let file_dir = TempDir::new().unwrap();
    let sqlite_dir = TempDir::new().unwrap();
    vec![
        Harness {
            label: "memory",
            backend: Box::new(MemoryBackend::new()),
            _dir: memory_dir,
        },
        Harness {
            label: "file",
            backend: Box::new(FileBackend::open_default(file_dir.path()).unwrap()),
            _dir: file_dir,
        },
        Harness {
            label: "sqlite",
            backend: Box::new(
                SqliteBackend::open_default(sqlite_dir.path().join("store.db")).unwrap(),
            ),
            _dir: sqlite_dir,
        },
    ]
}

fn seed(backend: &dyn StorageBackend) {
    backend
        .save(
            SaveRequest::new("hero-1", payload(json!({"hp": 10, "level": 3, "tags": ["fighter"]})))
                .display_name("Sir Roderick")
                .owner("alice"),
        )
        .unwrap();
    backend
        .save(
            SaveRequest::new("hero-1", payload(json!({"hp": 12, "level": 3, "tags": ["fighter"]})))
                .summary("took a potion"),
        )
        .unwrap_err(); // wrong caller: no owner supplied
    backend
        .save(
            SaveRequest::new("hero-1", payload(json!({"hp": 12, "level": 4, "tags": ["fighter"]})))
                .owner("alice")
                .summary("levelled up"),
        )
        .unwrap();
    backend
        .save(
            SaveRequest::new("hero-2", payload(json!({"hp": 6, "level": 9, "tags": ["wizard"]})))
                .display_name("Morwenna"),
        )
        .unwrap();
}

// =========================================================================
// Pairwise equivalence
// =========================================================================

/// After the same save sequence, every backend reports the same
/// versions, payloads, histories, and diffs.
#[test]
fn test_reads_agree_after_identical_saves() {
    let harnesses = all_backends();
    for h in &harnesses {
        seed(h.backend.as_ref());
    }

    for h in &harnesses {
        let latest = h.backend.get("hero-1", None, Some("alice")).unwrap();
        assert_eq!(latest.version, 2, "backend {}", h.label);
        assert_eq!(
            latest.payload,
            payload(json!({"hp": 12, "level": 4, "tags": ["fighter"]})),
            "backend {}",
            h.label
        );
        assert_eq!(latest.change_summary.as_deref(), Some("levelled up"));

        let history = h.backend.history("hero-1", None, 0).unwrap();
        let versions: Vec<u64> = history.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![2, 1], "backend {}", h.label);

        let diff = h.backend.diff("hero-1", 1, 2).unwrap();
        assert_eq!(diff.changes.len(), 2, "backend {}", h.label);
        assert_eq!(diff.changes["hp"], (json!(10), json!(12)));
        assert_eq!(diff.changes["level"], (json!(3), json!(4)));
    }
}

/// Query filters produce the same result set everywhere.
#[test]
fn test_queries_agree() {
    let harnesses = all_backends();
    for h in &harnesses {
        seed(h.backend.as_ref());
    }

    let filters = vec![
        QueryFilter::default(),
        QueryFilter {
            name_substrings: Some(vec!["morwen".into()]),
            ..Default::default()
        },
        QueryFilter {
            tags: Some(vec!["fighter".into()]),
            ..Default::default()
        },
        QueryFilter {
            numeric_range: Some(vellum::NumericRange {
                field: "level".into(),
                min: Some(5.0),
                max: None,
            }),
            ..Default::default()
        },
        QueryFilter {
            owner_id: Some("alice".into()),
            ..Default::default()
        },
        QueryFilter {
            entity_ids: Some(vec!["hero-2".into(), "ghost".into()]),
            ..Default::default()
        },
        QueryFilter {
            limit: Some(1),
            offset: 1,
            ..Default::default()
        },
    ];

    for filter in &filters {
        let mut per_backend: Vec<(&str, Vec<(String, u64)>)> = Vec::new();
        for h in &harnesses {
            let results = h.backend.query(filter).unwrap();
            per_backend.push((
                h.label,
                results
                    .iter()
                    .map(|s| (s.entity_id.clone(), s.version))
                    .collect(),
            ));
        }
        let (first_label, first) = &per_backend[0];
        for (label, results) in &per_backend[1..] {
            assert_eq!(
                results, first,
                "filter {filter:?}: {label} disagrees with {first_label}"
            );
        }
    }
}

/// Name matching folds case with Unicode rules on every backend, not
/// just for ASCII.
#[test]
fn test_unicode_name_matching_agrees() {
    let harnesses = all_backends();
    for h in &harnesses {
        h.backend
            .save(
                SaveRequest::new("hero-3", payload(json!({"hp": 1})))
                    .display_name("MÖRWENNA"),
            )
            .unwrap();

        let filter = QueryFilter {
            name_substrings: Some(vec!["mör".into()]),
            ..Default::default()
        };
        let hits = h.backend.query(&filter).unwrap();
        assert_eq!(hits.len(), 1, "backend {}", h.label);
        assert_eq!(hits[0].entity_id, "hero-3", "backend {}", h.label);
    }
}

/// Malformed entity ids are rejected identically everywhere; ids one
/// backend cannot store must not succeed on another.
#[test]
fn test_invalid_entity_ids_rejected_everywhere() {
    let harnesses = all_backends();
    for h in &harnesses {
        for bad in ["", "..", "a/b", "archive"] {
            let result = h
                .backend
                .save(SaveRequest::new(bad, payload(json!({"hp": 1}))));
            assert!(
                matches!(result, Err(vellum::StoreError::Validation(_))),
                "backend {} accepted {bad:?}",
                h.label
            );
        }
    }
}

/// Delete semantics agree: soft hides, hard erases, both report
/// whether anything happened.
#[test]
fn test_delete_semantics_agree() {
    let harnesses = all_backends();
    for h in &harnesses {
        seed(h.backend.as_ref());

        assert!(h.backend.delete("hero-2", None, false).unwrap());
        assert!(!h.backend.delete("hero-2", None, false).unwrap());
        assert!(h.backend.get("hero-2", None, None).unwrap_err().is_not_found());

        assert!(h.backend.delete("hero-1", Some("alice"), true).unwrap());
        assert!(!h.backend.delete("hero-1", Some("alice"), true).unwrap());
        assert!(!h.backend.delete("ghost", None, true).unwrap());

        let stats = h.backend.stats().unwrap();
        assert_eq!(stats.entity_count, 1, "backend {}", h.label);
    }
}

// =========================================================================
// Export/import migration
// =========================================================================

/// A bundle exported from any backend imports into any other with the
/// full history intact.
#[test]
fn test_bundles_migrate_between_backends() {
    let sources = all_backends();
    for source in &sources {
        seed(source.backend.as_ref());
        let bytes = source.backend.export("hero-1", true).unwrap();

        for target in all_backends() {
            let latest = target.backend.import(&bytes).unwrap();
            assert_eq!(
                latest.version, 2,
                "{} -> {}",
                source.label, target.label
            );
            let history = target.backend.history("hero-1", None, 0).unwrap();
            assert_eq!(history.len(), 2, "{} -> {}", source.label, target.label);
            assert_eq!(
                history[1].payload,
                payload(json!({"hp": 10, "level": 3, "tags": ["fighter"]}))
            );
        }
    }
}

/// A latest-only export imports as a single version numbered 1.
#[test]
fn test_latest_only_export_renumbers() {
    let sources = all_backends();
    for source in &sources {
        seed(source.backend.as_ref());
        let bytes = source.backend.export("hero-1", false).unwrap();

        let target = MemoryBackend::new();
        let latest = target.import(&bytes).unwrap();
        assert_eq!(latest.version, 1, "source {}", source.label);
        assert_eq!(target.history("hero-1", None, 0).unwrap().len(), 1);
        assert_eq!(
            latest.payload,
            payload(json!({"hp": 12, "level": 4, "tags": ["fighter"]}))
        );
    }
}

/// Stats agree on entity and version counts after identical activity.
#[test]
fn test_stats_agree() {
    let harnesses = all_backends();
    for h in &harnesses {
        seed(h.backend.as_ref());
        let stats = h.backend.stats().unwrap();
        assert_eq!(stats.entity_count, 2, "backend {}", h.label);
        assert_eq!(stats.version_count, 3, "backend {}", h.label);
        assert!(stats.total_data_size > 0, "backend {}", h.label);
    }
}

/// File compression mode is a storage detail: payloads read back
/// identically under every mode.
#[test]
fn test_file_compression_modes_equivalent() {
    for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(
            dir.path(),
            compression,
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        seed(&backend);

        let latest = backend.get("hero-1", None, Some("alice")).unwrap();
        assert_eq!(
            latest.payload,
            payload(json!({"hp": 12, "level": 4, "tags": ["fighter"]})),
            "mode {compression:?}"
        );
    }
}
