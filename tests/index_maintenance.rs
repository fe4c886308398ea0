//! # Index Build and Rebuild Behavior
//!
//! Covers the maintenance properties of `Database::index`:
//!
//! 1. Building incrementally (`index(A, B)` then `index(B, C)`) matches a
//!    single combined build
//! 2. Re-running `index` on an up-to-date index is a byte-for-byte no-op
//! 3. A data file that outgrew its index forces a full rebuild
//! 4. A field stuck at `tx=1` (crashed build) blocks reads and is rebuilt
//!    identically to a clean build

use jify::{Database, FieldSpec, Index, JifyError, Predicate, Query, StoreConfig, Value};
use serde_json::json;
use tempfile::tempdir;

fn eq_query(field: &str, value: Value) -> Query {
    Query::new().field(field, Predicate::equals(value))
}

fn offsets(db: &Database, field: &str, value: Value) -> Vec<u64> {
    let mut offsets = db
        .find(&[eq_query(field, value)])
        .unwrap()
        .offsets()
        .to_vec();
    offsets.sort_unstable();
    offsets
}

fn seed(db: &Database) {
    db.insert(&[
        json!({"a": 1, "b": "x", "c": true}),
        json!({"a": 2, "b": "y", "c": false}),
        json!({"a": 1, "b": "y", "c": true}),
    ])
    .unwrap();
}

#[test]
fn incremental_builds_match_a_combined_build() {
    let dir = tempdir().unwrap();

    let staged = Database::open(write_empty(&dir, "staged.json")).unwrap();
    seed(&staged);
    staged.index(&[FieldSpec::new("a"), FieldSpec::new("b")]).unwrap();
    staged.index(&[FieldSpec::new("b"), FieldSpec::new("c")]).unwrap();

    let combined = Database::open(write_empty(&dir, "combined.json")).unwrap();
    seed(&combined);
    combined
        .index(&[FieldSpec::new("a"), FieldSpec::new("b"), FieldSpec::new("c")])
        .unwrap();

    for (field, value) in [
        ("a", Value::Number(1.0)),
        ("a", Value::Number(2.0)),
        ("b", Value::String("y".into())),
        ("c", Value::Bool(true)),
    ] {
        assert_eq!(
            offsets(&staged, field, value.clone()),
            offsets(&combined, field, value),
            "field {field}"
        );
    }
}

#[test]
fn reindexing_an_up_to_date_index_is_a_no_op() {
    let dir = tempdir().unwrap();
    let db = Database::open(write_empty(&dir, "db.json")).unwrap();
    seed(&db);
    db.index(&[FieldSpec::new("a")]).unwrap();

    let before = std::fs::read(db.index_path()).unwrap();
    db.index(&[FieldSpec::new("a")]).unwrap();
    let after = std::fs::read(db.index_path()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn stale_index_is_rebuilt_with_all_fields() {
    let dir = tempdir().unwrap();
    let path = write_empty(&dir, "db.json");
    let db = Database::open(&path).unwrap();
    seed(&db);
    db.index(&[FieldSpec::new("a")]).unwrap();

    // grow the data file behind the index's back; the mtime comparison has
    // to see the data file as strictly newer even on coarse filesystems
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let raw_store = jify::JsonStore::open(&path, &StoreConfig::default()).unwrap();
    raw_store.append(&json!({"a": 7, "b": "z"})).unwrap();

    db.index(&[FieldSpec::new("b")]).unwrap();

    // the rebuild re-registered "a" and picked up the out-of-band record
    assert_eq!(offsets(&db, "a", Value::Number(7.0)).len(), 1);
    assert_eq!(offsets(&db, "b", Value::String("z".into())).len(), 1);
    assert_eq!(offsets(&db, "a", Value::Number(1.0)).len(), 2);
}

#[test]
fn crashed_build_blocks_reads_then_rebuilds_identically() {
    let dir = tempdir().unwrap();
    let db = Database::open(write_empty(&dir, "db.json")).unwrap();
    seed(&db);
    db.index(&[FieldSpec::new("a")]).unwrap();
    let clean = offsets(&db, "a", Value::Number(1.0));

    // simulate a crash mid-build: the header stays flagged
    let index = Index::open(db.index_path(), &StoreConfig::default()).unwrap();
    index.begin_transaction("a").unwrap();
    drop(index);

    let err = db
        .find(&[eq_query("a", Value::Number(1.0))])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JifyError>(),
        Some(JifyError::FieldInTransaction(_))
    ));

    // the sticky flag forces a rebuild even though mtimes look fresh
    db.index(&[FieldSpec::new("a")]).unwrap();
    assert_eq!(offsets(&db, "a", Value::Number(1.0)), clean);
}

#[test]
fn rebuild_preserves_date_time_typing() {
    let dir = tempdir().unwrap();
    let db = Database::open(write_empty(&dir, "db.json")).unwrap();
    db.insert(&[
        json!({"born": "1990-01-01"}),
        json!({"born": "2001-01-01"}),
    ])
    .unwrap();
    db.index(&[FieldSpec::date_time("born")]).unwrap();

    // force a rebuild through the sticky flag
    let index = Index::open(db.index_path(), &StoreConfig::default()).unwrap();
    index.begin_transaction("born").unwrap();
    drop(index);
    db.index(&[]).unwrap();

    // still compared as dates, not as strings
    let results = offsets(&db, "born", Value::String("1990-01-01T00:00:00Z".into()));
    assert_eq!(results.len(), 1);
}

fn write_empty(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, "[\n]\n").unwrap();
    path
}
