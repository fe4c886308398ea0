//! # Jify - Append-Only JSON Document Database
//!
//! Jify stores records in a single human-readable JSON array file and
//! answers value and range queries through secondary indexes kept in a
//! companion JSON file, without ever scanning the data file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use jify::{Database, FieldSpec, Predicate, Query, Value};
//!
//! let db = Database::create("people.json", &[FieldSpec::new("age")])?;
//! db.insert(&[
//!     serde_json::json!({"name": "John", "age": 42}),
//!     serde_json::json!({"name": "Jane", "age": 17}),
//! ])?;
//!
//! let adults = Query::new().field(
//!     "age",
//!     Predicate::new(vec![]).condition(jify::Op::Ge, Value::Number(18.0)),
//! );
//! for record in db.find(&[adults])? {
//!     println!("{}", record?);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Database)         │  insert / find / index / drop
//! ├─────────────────────────────────────┤
//! │  JSON store        │  Skip-list      │  data file      index file
//! │  (record bytes)    │  index          │
//! ├─────────────────────────────────────┤
//! │      JSON element scanner            │  byte-exact value ranges
//! ├─────────────────────────────────────┤
//! │  Byte reader │ Z85 codec │ Locking   │
//! ├─────────────────────────────────────┤
//! │      Positioned file I/O             │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! db.json          # JSON array of records, indent 2, trailer "\n]\n"
//! db.index.json    # JSON array of skip-list entries, one per line
//! ```
//!
//! Records are immutable once appended; their byte offsets are the stable
//! identities everything else refers to. The index maps field values to
//! record offsets through an on-disk skip list whose entries reference each
//! other by byte offset within the index file.
//!
//! ## Guarantees
//!
//! - Any successful append leaves the data file parsing as a complete JSON
//!   array (the trailer is rewritten atomically under the append lock).
//! - A reader that observes an index entry can always fetch its record:
//!   record bytes are flushed before index entries referencing them.
//! - A crashed insert or build leaves the affected field flagged `tx=1`;
//!   the next `index(...)` call detects it (along with stale mtimes) and
//!   rebuilds from the records.
//!
//! ## Module Overview
//!
//! - [`storage`]: positioned file I/O, byte-range locking, UTF-8 byte reader
//! - [`json`]: byte-exact JSON element scanner
//! - [`encoding`]: Z85 integer/double codec for entry payloads
//! - [`store`]: the JSON-array file discipline (append, get, iterate)
//! - [`index`]: the persistent skip list (fields, batches, predicates)
//! - [`database`]: the orchestrating API
//! - [`cli`]: argument parsing and subcommands for the `jify` binary

pub mod cli;
pub mod database;
pub mod encoding;
pub mod error;
pub mod index;
pub mod json;
pub mod storage;
pub mod store;
pub mod types;

pub use database::{Database, DatabaseConfig, FindResults, Query};
pub use error::JifyError;
pub use index::{Condition, FieldKind, FieldSpec, Index, IndexItem, Op, Predicate};
pub use store::{JsonStore, StoreConfig};
pub use types::Value;
