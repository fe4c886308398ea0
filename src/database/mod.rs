//! # Database Module
//!
//! The high-level API, wiring the JSON store (record bytes) and the index
//! (ordered field lookup) behind one struct.
//!
//! ## Files
//!
//! A database is two files: the data file named by the caller and a
//! companion index file derived from it (`db.json` → `db.index.json`). The
//! index file may be absent: `insert` then appends records without index
//! maintenance, and `index(...)` creates it on first use.
//!
//! ## Insert Pipeline
//!
//! ```text
//! records ──► stringify ──► one buffered write (lock at byte 0)
//!    │                         offsets from append position + joiners
//!    └──► per indexed field: begin tx ──► batch insert ──► end tx
//! ```
//!
//! Record bytes are flushed before any index entry referencing them, so a
//! reader that finds an entry can always fetch its record. A failure between
//! begin and end leaves the field flagged `tx=1`; the next `index(...)`
//! rebuilds it from the records, which are already durable.
//!
//! ## Find
//!
//! Each query is a conjunction of per-field predicates; multiple queries
//! form a disjunction. Index probes run eagerly (intersection, then union,
//! preserving first-seen order); record fetches are lazy through the
//! returned iterator.
//!
//! ## Index Builds
//!
//! `index(...)` extends the index with missing fields by streaming every
//! record once and flushing per-field batches at the configured limit. When
//! the index is outdated (data file newer than the index, or any header
//! stuck at `tx=1`), it is dropped and rebuilt with the union of old and
//! new fields. Rebuilding is idempotent: running `index` on an up-to-date
//! index is a no-op.

mod config;

pub use config::DatabaseConfig;

use std::path::{Path, PathBuf};
use std::time::Instant;

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use serde_json::Value as Json;
use tracing::debug;

use crate::error::JifyError;
use crate::index::{FieldMeta, FieldSpec, Index, IndexItem, Predicate};
use crate::store::{JsonStore, TRAILER};
use crate::storage::LockedFile;
use crate::types::Value;

/// A conjunction of per-field predicates. Several queries passed to
/// [`Database::find`] form a disjunction.
#[derive(Debug, Clone, Default)]
pub struct Query {
    terms: Vec<(String, Predicate)>,
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn field(mut self, name: impl Into<String>, predicate: Predicate) -> Query {
        self.terms.push((name.into(), predicate));
        self
    }

    pub fn terms(&self) -> &[(String, Predicate)] {
        &self.terms
    }
}

#[derive(Debug)]
pub struct Database {
    index_path: PathBuf,
    store: JsonStore,
    config: DatabaseConfig,
}

impl Database {
    /// Creates the data file, the index file, and the given field headers.
    pub fn create<P: AsRef<Path>>(path: P, fields: &[FieldSpec]) -> Result<Database> {
        Self::create_with_config(path, fields, DatabaseConfig::default())
    }

    pub fn create_with_config<P: AsRef<Path>>(
        path: P,
        fields: &[FieldSpec],
        config: DatabaseConfig,
    ) -> Result<Database> {
        let store = JsonStore::create(&path, &[], &config.store)?;
        let index_path = derive_index_path(path.as_ref());
        let index = Index::create(&index_path, &config.store)?;
        index.add_fields(fields)?;
        Ok(Database {
            index_path,
            store,
            config,
        })
    }

    /// Opens an existing database; the index file may or may not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Database> {
        let store = JsonStore::open(&path, &config.store)?;
        let index_path = derive_index_path(path.as_ref());
        Ok(Database {
            index_path,
            store,
            config,
        })
    }

    /// Deletes the data file and, when present, the index file.
    pub fn destroy(self) -> Result<()> {
        let index_path = self.index_path.clone();
        self.store.destroy()?;
        match LockedFile::remove(&index_path) {
            Ok(()) => Ok(()),
            Err(err) if matches!(err.downcast_ref::<JifyError>(), Some(JifyError::NotFound(_))) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    /// Appends records and maintains every registered index. Returns the
    /// record offsets in input order.
    pub fn insert(&self, records: &[Json]) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in records {
            if !record.is_object() {
                return Err(JifyError::InvalidFormat(format!(
                    "record must be a JSON object, got {record}"
                ))
                .into());
            }
        }
        let started = Instant::now();
        let index = self.open_index()?;
        let indexed = match &index {
            Some(index) => index.fields()?,
            None => Vec::new(),
        };

        let mut batches: HashMap<String, Vec<IndexItem>> = HashMap::new();
        let offsets = {
            let _append = self.store.lock_exclusive(0)?;
            let (start, first) = self.store.append_position()?;

            let mut raw = String::new();
            let mut offsets = Vec::with_capacity(records.len());
            let mut cursor = start;
            for (i, record) in records.iter().enumerate() {
                let joiner = self.store.joiner(if i == 0 { first } else { false });
                let text = self.store.stringify(record)?;
                let offset = cursor + joiner.len() as u64;
                for meta in &indexed {
                    if let Some(value) = record.get(&meta.name).and_then(|v| Value::from_json(v)) {
                        batches.entry(meta.name.clone()).or_default().push(IndexItem {
                            value,
                            position: offset,
                        });
                    }
                }
                raw.push_str(&joiner);
                raw.push_str(&text);
                offsets.push(offset);
                cursor = offset + text.len() as u64;
            }
            raw.push_str(TRAILER);

            // one write publishes the whole batch, trailer included; record
            // bytes are durable before any index entry references them
            self.store.write(raw.as_bytes(), start)?;
            self.store.sync()?;
            offsets
        };

        if let Some(index) = &index {
            for meta in &indexed {
                let Some(items) = batches.remove(&meta.name) else {
                    continue;
                };
                index.begin_transaction(&meta.name)?;
                index.insert(&meta.name, items)?;
                index.end_transaction(&meta.name)?;
            }
        }
        debug!(
            target: "jify::database",
            records = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "insert complete"
        );
        Ok(offsets)
    }

    /// Runs queries against the index and returns a lazy iterator over the
    /// matching records. Within a query the per-field position sets are
    /// intersected; across queries they are unioned.
    pub fn find(&self, queries: &[Query]) -> Result<FindResults<'_>> {
        let started = Instant::now();
        let index = self.open_index()?.ok_or_else(|| {
            JifyError::NotFound(format!("index file '{}'", self.index_path.display()))
        })?;

        let mut combined = Vec::new();
        let mut seen = HashSet::new();
        for query in queries {
            let mut terms = query.terms().iter();
            let Some((first_field, first_predicate)) = terms.next() else {
                return Err(JifyError::PredicateInvalid("query has no conditions".into()).into());
            };
            let mut positions = index.find(first_field, first_predicate)?;
            for (field, predicate) in terms {
                let other: HashSet<u64> = index.find(field, predicate)?.into_iter().collect();
                positions.retain(|position| other.contains(position));
            }
            for position in positions {
                if seen.insert(position) {
                    combined.push(position);
                }
            }
        }
        debug!(
            target: "jify::database",
            queries = queries.len(),
            matches = combined.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "find complete"
        );
        Ok(FindResults {
            store: &self.store,
            offsets: combined.into_iter(),
        })
    }

    /// Builds indexes for fields not yet present. An outdated index (data
    /// file newer than the index, or a field stuck in a transaction) is
    /// dropped and rebuilt with the union of previously-registered and
    /// requested fields.
    pub fn index(&self, fields: &[FieldSpec]) -> Result<()> {
        let started = Instant::now();
        let (index, build) = match self.open_index()? {
            None => {
                let index = Index::create(&self.index_path, &self.config.store)?;
                (index, fields.to_vec())
            }
            Some(index) => {
                let existing = index.fields()?;
                if self.index_outdated(&index, &existing)? {
                    let mut build: Vec<FieldSpec> =
                        existing.iter().map(FieldSpec::from).collect();
                    for spec in fields {
                        if build.iter().all(|known| known.name != spec.name) {
                            build.push(spec.clone());
                        }
                    }
                    debug!(target: "jify::database", "index outdated, rebuilding");
                    index.destroy()?;
                    let index = Index::create(&self.index_path, &self.config.store)?;
                    (index, build)
                } else {
                    let build = fields
                        .iter()
                        .filter(|spec| existing.iter().all(|known| known.name != spec.name))
                        .cloned()
                        .collect();
                    (index, build)
                }
            }
        };
        if build.is_empty() {
            debug!(target: "jify::database", "index is up to date");
            return Ok(());
        }

        index.add_fields(&build)?;
        for spec in &build {
            index.begin_transaction(&spec.name)?;
        }

        let mut batches: HashMap<&str, Vec<IndexItem>> = HashMap::new();
        let mut scanned = 0u64;
        for element in self.store.iter()? {
            let (offset, record) = element?;
            scanned += 1;
            for spec in &build {
                let Some(value) = record.get(&spec.name).and_then(|v| Value::from_json(v)) else {
                    continue;
                };
                let batch = batches.entry(spec.name.as_str()).or_default();
                batch.push(IndexItem {
                    value,
                    position: offset,
                });
                if batch.len() >= self.config.batch_limit {
                    index.insert(&spec.name, std::mem::take(batch))?;
                }
            }
        }
        for spec in &build {
            if let Some(batch) = batches.remove(spec.name.as_str()) {
                index.insert(&spec.name, batch)?;
            }
            index.end_transaction(&spec.name)?;
        }
        debug!(
            target: "jify::database",
            fields = build.len(),
            records = scanned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index build complete"
        );
        Ok(())
    }

    /// The index is up to date iff the data file is not newer than the index
    /// file and no field is stuck mid-transaction.
    fn index_outdated(&self, index: &Index, fields: &[FieldMeta]) -> Result<bool> {
        if fields.iter().any(|meta| meta.tx != 0) {
            return Ok(true);
        }
        Ok(self.store.modified()? > index.modified()?)
    }

    fn open_index(&self) -> Result<Option<Index>> {
        match Index::open(&self.index_path, &self.config.store) {
            Ok(index) => Ok(Some(index)),
            Err(err) if matches!(err.downcast_ref::<JifyError>(), Some(JifyError::NotFound(_))) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Lazy record iterator over the offsets a find produced.
#[derive(Debug)]
pub struct FindResults<'a> {
    store: &'a JsonStore,
    offsets: std::vec::IntoIter<u64>,
}

impl FindResults<'_> {
    /// Record offsets not yet consumed, in result order.
    pub fn offsets(&self) -> &[u64] {
        self.offsets.as_slice()
    }
}

impl Iterator for FindResults<'_> {
    type Item = Result<Json>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.next()?;
        Some(
            self.store
                .get(offset)
                .map(|item| item.value.unwrap_or(Json::Null)),
        )
    }
}

fn derive_index_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => path.with_extension(format!("index.{ext}")),
        None => path.with_extension("index"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Op;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn index_path_derivation() {
        assert_eq!(
            derive_index_path(Path::new("/tmp/db.json")),
            Path::new("/tmp/db.index.json")
        );
        assert_eq!(
            derive_index_path(Path::new("/tmp/db")),
            Path::new("/tmp/db.index")
        );
    }

    #[test]
    fn create_then_insert_then_find() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db.json"), &[FieldSpec::new("age")]).unwrap();
        db.insert(&[
            json!({"name": "John", "age": 42}),
            json!({"name": "Jane", "age": 17}),
        ])
        .unwrap();

        let results: Vec<Json> = db
            .find(&[Query::new().field("age", Predicate::equals(Value::Number(42.0)))])
            .unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(results, [json!({"name": "John", "age": 42})]);
    }

    #[test]
    fn insert_rejects_non_objects() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db.json"), &[]).unwrap();
        let err = db.insert(&[json!([1, 2, 3])]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JifyError>(),
            Some(JifyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn insert_returns_offsets_usable_with_store_get() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db.json"), &[]).unwrap();
        let offsets = db
            .insert(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(
            db.store().get(offsets[1]).unwrap().value,
            Some(json!({"n": 2}))
        );
    }

    #[test]
    fn conjunction_intersects_fields() {
        let dir = tempdir().unwrap();
        let db = Database::create(
            dir.path().join("db.json"),
            &[FieldSpec::new("age"), FieldSpec::new("name")],
        )
        .unwrap();
        db.insert(&[
            json!({"name": "John", "age": 42}),
            json!({"name": "John", "age": 17}),
            json!({"name": "Jane", "age": 42}),
        ])
        .unwrap();

        let query = Query::new()
            .field("name", Predicate::equals(Value::String("John".into())))
            .field("age", Predicate::equals(Value::Number(42.0)));
        let results: Vec<Json> = db.find(&[query]).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(results, [json!({"name": "John", "age": 42})]);
    }

    #[test]
    fn disjunction_unions_queries_without_duplicates() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db.json"), &[FieldSpec::new("age")]).unwrap();
        db.insert(&[
            json!({"age": 10}),
            json!({"age": 20}),
            json!({"age": 30}),
        ])
        .unwrap();

        // both queries match {age: 20}; the union reports it once
        let below = Query::new().field(
            "age",
            Predicate::new(vec![]).condition(Op::Lt, Value::Number(25.0)),
        );
        let above = Query::new().field(
            "age",
            Predicate::new(vec![]).condition(Op::Gt, Value::Number(15.0)),
        );
        let results = db.find(&[below, above]).unwrap();
        assert_eq!(results.offsets().len(), 3);
    }

    #[test]
    fn empty_query_is_invalid() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db.json"), &[]).unwrap();
        let err = db.find(&[Query::new()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JifyError>(),
            Some(JifyError::PredicateInvalid(_))
        ));
    }

    #[test]
    fn find_without_index_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "[\n]\n").unwrap();
        let db = Database::open(&path).unwrap();
        let err = db
            .find(&[Query::new().field("age", Predicate::equals(Value::Null))])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JifyError>(),
            Some(JifyError::NotFound(_))
        ));
    }

    #[test]
    fn index_builds_over_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(
            &path,
            "[\n  {\"age\": 42},\n  {\"age\": 17},\n  {\"age\": 50}\n]\n",
        )
        .unwrap();
        let db = Database::open(&path).unwrap();
        db.index(&[FieldSpec::new("age")]).unwrap();

        let results: Vec<Json> = db
            .find(&[Query::new().field("age", Predicate::equals(Value::Number(17.0)))])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results, [json!({"age": 17})]);
    }

    #[test]
    fn small_batch_limit_flushes_incrementally() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "[\n]\n").unwrap();
        let db =
            Database::open_with_config(&path, DatabaseConfig::default().with_batch_limit(2))
                .unwrap();
        db.insert(&(0..7).map(|n| json!({"n": n})).collect::<Vec<_>>())
            .unwrap();
        db.index(&[FieldSpec::new("n")]).unwrap();

        for n in 0..7 {
            let results = db
                .find(&[Query::new().field("n", Predicate::equals(Value::Number(n as f64)))])
                .unwrap();
            assert_eq!(results.offsets().len(), 1, "n = {n}");
        }
    }

    #[test]
    fn destroy_removes_both_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let db = Database::create(&path, &[FieldSpec::new("age")]).unwrap();
        let index_path = db.index_path().to_path_buf();
        db.destroy().unwrap();
        assert!(!path.exists());
        assert!(!index_path.exists());
    }

    #[test]
    fn destroy_tolerates_missing_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "[\n]\n").unwrap();
        Database::open(&path).unwrap().destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn insert_into_invalid_file_fails_with_invalid_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "invalid").unwrap();
        let db = Database::open(&path).unwrap();
        let err = db.insert(&[json!({})]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JifyError>(),
            Some(JifyError::InvalidFormat(_))
        ));
    }
}
