//! # On-Disk Format Guarantees
//!
//! The data file must parse as a plain JSON array whose elements are exactly
//! the inserted records in order, after any number of appends. The index
//! file must stay one-entry-per-line with indent 0. Malformed files are
//! rejected with `InvalidFormat`.

use jify::{Database, FieldSpec, JifyError};
use serde_json::{json, Value as Json};
use tempfile::tempdir;

#[test]
fn data_file_is_always_a_valid_json_array() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let db = Database::create(&path, &[]).unwrap();

    let mut expected = Vec::new();
    for round in 0..5 {
        let batch: Vec<Json> = (0..3)
            .map(|n| json!({"round": round, "n": n}))
            .collect();
        db.insert(&batch).unwrap();
        expected.extend(batch);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("\n]\n"), "trailer after round {round}");
        let parsed: Vec<Json> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, expected, "array contents after round {round}");
    }
}

#[test]
fn records_are_pretty_printed_at_indent_two() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let db = Database::create(&path, &[]).unwrap();
    db.insert(&[json!({"name": "John", "age": 42})]).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        content,
        "[\n  {\n    \"name\": \"John\",\n    \"age\": 42\n  }\n]\n"
    );
}

#[test]
fn index_file_is_line_oriented() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    let db = Database::create(&path, &[FieldSpec::new("age")]).unwrap();
    db.insert(&[json!({"age": 1}), json!({"age": 2})]).unwrap();

    let content = std::fs::read_to_string(db.index_path()).unwrap();
    let parsed: Vec<Json> = serde_json::from_str(&content).unwrap();
    // root + header + two value entries
    assert_eq!(parsed.len(), 4);
    for line in content.lines().skip(1).take(parsed.len()) {
        let element = line.trim_end_matches(',');
        let object: Json = serde_json::from_str(element).unwrap();
        assert!(object.is_object(), "each index line is one entry");
    }
}

#[test]
fn inserting_into_a_non_array_file_is_invalid_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    std::fs::write(&path, "invalid").unwrap();

    let db = Database::open(&path).unwrap();
    let err = db.insert(&[json!({})]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JifyError>(),
        Some(JifyError::InvalidFormat(_))
    ));
    // the file was not touched
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "invalid");
}

#[test]
fn line_delimited_data_can_be_indexed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.jsonl");
    std::fs::write(&path, "{\"age\": 1}\n{\"age\": 2}\n{\"age\": 2}\n").unwrap();

    let db = Database::open(&path).unwrap();
    db.index(&[FieldSpec::new("age")]).unwrap();

    let results = db
        .find(&[jify::Query::new().field(
            "age",
            jify::Predicate::equals(jify::Value::Number(2.0)),
        )])
        .unwrap();
    assert_eq!(results.offsets().len(), 2);
}

#[test]
fn empty_database_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.json");
    Database::create(&path, &[]).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "[\n]\n");

    let db = Database::open(&path).unwrap();
    db.insert(&[]).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "[\n]\n");
}
