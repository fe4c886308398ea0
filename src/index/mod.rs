//! # Persistent Skip-List Index
//!
//! An ordered multimap `field → value → record offset`, stored as entries of
//! a JSON array file (indent 0, one entry per line). Offsets inside entries
//! are byte positions into the same index file, so the structure is fully
//! self-contained and navigable with nothing but positioned reads.
//!
//! ## Layout
//!
//! ```text
//! [
//! {"":"...root..."}                      root, link → first header
//! {"age":"...header, 32 levels..."}      field header = list head
//! {"age":"...value 42, levels..."}       value entry, pointer → record
//! {"age":"...duplicate, no node..."}     value-equal duplicate via link
//! ...
//! ]
//! ```
//!
//! Each field owns one skip list rooted at its header. Level-0 order is
//! ascending by the value's comparison key; only the first occurrence of a
//! distinct value sits in the leveled lists, and further occurrences chain
//! off it through `link`. Entries are append-only: splicing rewrites
//! predecessors in place (fixed-width fields) and never moves bytes.
//!
//! ## Batched Insert
//!
//! A batch for one field runs under an exclusive lock on the field header:
//!
//! 1. values are coerced (`date-time`) and sorted descending,
//! 2. each item is spliced in memory: new entries get negative placeholder
//!    positions, touched predecessors accumulate in a read-through cache,
//! 3. under the file-wide append lock the real offsets are computed,
//!    placeholders substituted, and the whole batch lands in one append,
//! 4. touched predecessors are rewritten in place.
//!
//! A crash before step 3 publishes nothing; a crash after it can leave
//! unreachable tail bytes and a header still flagged `tx=1`, which the next
//! full build treats as garbage and rebuilds.
//!
//! ## Find
//!
//! Under a shared header lock, the search descends from the top level
//! advancing while the predicate reports the next value below its range;
//! once a value inside the range is seen it drops to level 0 and walks
//! forward, emitting pointers (and duplicate chains) until the range is
//! exited. A header with `tx=1` refuses reads with `FieldInTransaction`.

mod entry;
mod predicate;

pub use entry::{FieldMeta, IndexEntry, LevelVec, Node, MAX_HEIGHT};
pub use predicate::{Condition, Op, Predicate};

use std::cmp::Ordering;
use std::path::Path;
use std::time::SystemTime;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::JifyError;
use crate::store::{JsonStore, StoreConfig};
use crate::types::{coerce_date, Value};

/// Byte offset of the root entry: right after the `"[\n"` prefix of an
/// indent-0 store file.
pub const ROOT_POSITION: u64 = 2;

/// A field registered for indexing, optionally typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: Option<FieldKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    DateTime,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            kind: None,
        }
    }

    pub fn date_time(name: impl Into<String>) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            kind: Some(FieldKind::DateTime),
        }
    }

    /// Parses the CLI form `NAME[:TYPE]`.
    pub fn parse(text: &str) -> Result<FieldSpec> {
        let (name, kind) = match text.split_once(':') {
            None => (text, None),
            Some((name, kind)) if kind == FieldMeta::DATE_TIME => {
                (name, Some(FieldKind::DateTime))
            }
            Some((_, other)) => bail!(JifyError::InvalidFormat(format!(
                "unknown field type '{other}'"
            ))),
        };
        ensure!(
            !name.is_empty(),
            JifyError::InvalidFormat("empty field name".into())
        );
        Ok(FieldSpec {
            name: name.to_string(),
            kind,
        })
    }

    fn meta(&self) -> FieldMeta {
        FieldMeta {
            name: self.name.clone(),
            kind: self.kind.map(|FieldKind::DateTime| FieldMeta::DATE_TIME.to_string()),
            tx: 0,
        }
    }
}

impl From<&FieldMeta> for FieldSpec {
    fn from(meta: &FieldMeta) -> FieldSpec {
        FieldSpec {
            name: meta.name.clone(),
            kind: meta.is_date_time().then_some(FieldKind::DateTime),
        }
    }
}

/// One value of a field in one record, ready for insertion.
#[derive(Debug, Clone)]
pub struct IndexItem {
    pub value: Value,
    /// Record offset in the data file.
    pub position: u64,
}

#[derive(Debug)]
pub struct Index {
    store: JsonStore,
}

impl Index {
    /// Creates the index file with its root entry.
    pub fn create<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Index> {
        let config = config.clone().with_indent(0);
        let root = IndexEntry::root().to_json()?;
        let store = JsonStore::create(path, &[root], &config)?;
        Ok(Index { store })
    }

    /// Opens an existing index file.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Index> {
        let config = config.clone().with_indent(0);
        let store = JsonStore::open(path, &config)?;
        Ok(Index { store })
    }

    pub fn destroy(self) -> Result<()> {
        self.store.destroy()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn modified(&self) -> Result<SystemTime> {
        self.store.modified()
    }

    fn read_entry(&self, position: u64) -> Result<IndexEntry> {
        let item = self.store.get(position)?;
        let value = item.value.unwrap_or(serde_json::Value::Null);
        IndexEntry::parse(item.start, &value)
            .wrap_err_with(|| format!("bad index entry at offset {position}"))
    }

    /// Walks the header chain from the root: `(position, header)` per field,
    /// in registration order.
    fn headers(&self) -> Result<Vec<(u64, IndexEntry)>> {
        let root = self.read_entry(ROOT_POSITION)?;
        let mut out = Vec::new();
        let mut next = root.link;
        while next != 0 {
            let entry = self.read_entry(next as u64)?;
            let link = entry.link;
            out.push((next as u64, entry));
            next = link;
        }
        Ok(out)
    }

    /// Metadata of every registered field, in registration order.
    pub fn fields(&self) -> Result<Vec<FieldMeta>> {
        self.headers()?
            .iter()
            .map(|(_, header)| header.meta())
            .collect()
    }

    fn find_header(&self, field: &str) -> Result<Option<(u64, IndexEntry)>> {
        Ok(self
            .headers()?
            .into_iter()
            .find(|(_, header)| header.label == field))
    }

    fn header_position(&self, field: &str) -> Result<u64> {
        match self.find_header(field)? {
            Some((position, _)) => Ok(position),
            None => Err(JifyError::FieldMissing(field.to_string()).into()),
        }
    }

    /// Registers fields that are not yet present: appends a header with 32
    /// zeroed levels and patches the previous header's link in place.
    pub fn add_fields(&self, fields: &[FieldSpec]) -> Result<()> {
        for spec in fields {
            if self.find_header(&spec.name)?.is_some() {
                continue;
            }
            let (tail_position, mut tail) = match self.headers()?.pop() {
                Some(last) => last,
                None => (ROOT_POSITION, self.read_entry(ROOT_POSITION)?),
            };
            let header = IndexEntry::field_header(&spec.meta())?;

            let start = {
                let _append = self.store.lock_exclusive(0)?;
                let (position, first) = self.store.append_position()?;
                let raw = self.store.stringify(&header.to_json()?)?;
                let (start, _) = self.store.append_raw(&raw, Some(position), Some(first))?;
                start
            };
            tail.link = start as i64;
            self.store.set(tail_position, &tail.to_json()?)?;
            trace!(target: "jify::index", field = %spec.name, offset = start, "field registered");
        }
        self.store.sync()
    }

    /// Flags the field header as having a build in progress.
    pub fn begin_transaction(&self, field: &str) -> Result<()> {
        self.set_tx(field, 1)
    }

    /// Clears the in-progress flag.
    pub fn end_transaction(&self, field: &str) -> Result<()> {
        self.set_tx(field, 0)
    }

    fn set_tx(&self, field: &str, tx: u8) -> Result<()> {
        let position = self.header_position(field)?;
        let _lock = self.store.lock_exclusive(position)?;
        let mut header = self.read_entry(position)?;
        let mut meta = header.meta()?;
        if meta.tx == tx {
            return Ok(());
        }
        meta.tx = tx;
        header.set_meta(&meta)?;
        self.store.set(position, &header.to_json()?)?;
        self.store.sync()
    }

    /// Inserts a batch of `(value, record offset)` items for one field.
    ///
    /// The whole batch lands in a single append; predecessors touched by the
    /// splices are rewritten in place afterwards. Runs under an exclusive
    /// lock on the field header, with the file-wide append lock held only
    /// around offset assignment and the append itself.
    pub fn insert(&self, field: &str, mut items: Vec<IndexItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let position = self.header_position(field)?;
        let _header_lock = self.store.lock_exclusive(position)?;
        let header = self.read_entry(position)?;
        let meta = header.meta()?;
        if meta.is_date_time() {
            for item in &mut items {
                item.value = coerce_date(&item.value)?;
            }
        }
        // descending, so equal values group and splice as one duplicate run
        items.sort_by(|a, b| b.value.compare(&a.value));

        let header_ref = position as i64;
        let mut cache = EntryCache::new(&self.store);
        cache.seed(header_ref, header);
        let mut rng = SmallRng::from_entropy();

        for item in &items {
            let mut updates = [header_ref; MAX_HEIGHT];
            let mut cursor = header_ref;
            for level in (0..MAX_HEIGHT).rev() {
                loop {
                    let next = cache.level_of(cursor, level)?;
                    if next == 0 {
                        break;
                    }
                    if cache.value_of(next)?.compare(&item.value) != Ordering::Greater {
                        cursor = next;
                    } else {
                        break;
                    }
                }
                updates[level] = cursor;
            }

            let pending_ref = cache.next_pending_ref();
            let previous = updates[0];
            let duplicate =
                previous != header_ref && cache.value_of(previous)? == item.value;
            if duplicate {
                // chain behind the primary; duplicates carry no levels
                let chain = cache.link_of(previous)?;
                cache.set_link(previous, pending_ref)?;
                cache.push_pending(IndexEntry {
                    position: pending_ref,
                    label: field.to_string(),
                    pointer: item.position,
                    link: chain,
                    node: None,
                });
            } else {
                let height = random_level(&mut rng, MAX_HEIGHT);
                let mut levels = LevelVec::from_elem(0, height + 1);
                for (level, slot) in levels.iter_mut().enumerate() {
                    *slot = cache.level_of(updates[level], level)?;
                }
                for (level, update) in updates.iter().enumerate().take(height + 1) {
                    cache.set_level(*update, level, pending_ref)?;
                }
                cache.push_pending(IndexEntry {
                    position: pending_ref,
                    label: field.to_string(),
                    pointer: item.position,
                    link: 0,
                    node: Some(Node {
                        levels,
                        value: item.value.clone(),
                    }),
                });
            }
        }

        let offsets = {
            let _append = self.store.lock_exclusive(0)?;
            let (start, first) = self.store.append_position()?;

            // placeholder substitution cannot change lengths (fixed-width
            // offsets), so assign real offsets from a zeroed probe pass
            let mut offsets = Vec::with_capacity(cache.pending.len());
            let mut cursor = start;
            for (i, pending) in cache.pending.iter().enumerate() {
                let probe = substitute(pending, |reference| Ok(reference.max(0)))?;
                let length = self.store.stringify(&probe.to_json()?)?.len() as u64;
                let offset = cursor + self.store.joiner_len(if i == 0 { first } else { false });
                offsets.push(offset);
                cursor = offset + length;
            }

            let mut raw = String::new();
            for (i, pending) in cache.pending.iter().enumerate() {
                if i > 0 {
                    raw.push_str(&self.store.joiner(false));
                }
                let resolved = substitute(pending, |r| resolve_slot(r, &offsets))?;
                raw.push_str(&self.store.stringify(&resolved.to_json()?)?);
            }
            self.store.append_raw(&raw, Some(start), Some(first))?;
            offsets
        };

        let mut touched: Vec<i64> = cache.touched.iter().copied().collect();
        touched.sort_unstable();
        for touched_position in touched {
            let entry = cache.disk_entry(touched_position)?;
            let resolved = substitute(entry, |r| resolve_slot(r, &offsets))?;
            self.store.set(touched_position as u64, &resolved.to_json()?)?;
        }
        self.store.sync()?;
        trace!(
            target: "jify::index",
            field,
            inserted = items.len(),
            rewritten = cache.touched.len(),
            "batch inserted"
        );
        Ok(())
    }

    /// Record offsets of entries matching the predicate, in list order with
    /// duplicate chains expanded.
    pub fn find(&self, field: &str, predicate: &Predicate) -> Result<Vec<u64>> {
        let position = self.header_position(field)?;
        let _lock = self.store.lock_shared(position)?;
        let header = self.read_entry(position)?;
        let meta = header.meta()?;
        if meta.tx != 0 {
            return Err(JifyError::FieldInTransaction(field.to_string()).into());
        }
        let predicate = if meta.is_date_time() {
            predicate.coerce_dates()?
        } else {
            predicate.clone()
        };

        let header_ref = position as i64;
        let mut cache = EntryCache::new(&self.store);
        cache.seed(header_ref, header);

        let mut cursor = header_ref;
        'descent: for level in (0..MAX_HEIGHT).rev() {
            loop {
                let next = cache.level_of(cursor, level)?;
                if next == 0 {
                    break;
                }
                match predicate.seek(&cache.value_of(next)?) {
                    Ordering::Less => cursor = next,
                    Ordering::Equal => break 'descent,
                    Ordering::Greater => break,
                }
            }
        }

        let mut out = Vec::new();
        let mut matched = false;
        let mut current = cache.level_of(cursor, 0)?;
        while current != 0 {
            let value = cache.value_of(current)?;
            match predicate.seek(&value) {
                Ordering::Equal => {
                    matched = true;
                    out.push(cache.pointer_of(current)?);
                    let mut chain = cache.link_of(current)?;
                    while chain != 0 {
                        out.push(cache.pointer_of(chain)?);
                        chain = cache.link_of(chain)?;
                    }
                }
                Ordering::Greater => break,
                Ordering::Less => {
                    if matched {
                        break;
                    }
                }
            }
            current = cache.level_of(current, 0)?;
        }
        trace!(target: "jify::index", field, matches = out.len(), "find complete");
        Ok(out)
    }
}

/// Coin-flip level selection capped below the list height.
fn random_level(rng: &mut SmallRng, height: usize) -> usize {
    let mut level = 0;
    while level + 1 < height && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}

/// Read-through entry cache for one locked operation. Disk entries load on
/// first touch; entries planned by the current batch live in `pending` and
/// are addressed by negative references (`-1 - slot`).
#[derive(Debug)]
struct EntryCache<'a> {
    store: &'a JsonStore,
    disk: HashMap<i64, IndexEntry>,
    pending: Vec<IndexEntry>,
    touched: HashSet<i64>,
}

impl<'a> EntryCache<'a> {
    fn new(store: &'a JsonStore) -> EntryCache<'a> {
        EntryCache {
            store,
            disk: HashMap::new(),
            pending: Vec::new(),
            touched: HashSet::new(),
        }
    }

    fn seed(&mut self, position: i64, entry: IndexEntry) {
        self.disk.insert(position, entry);
    }

    fn next_pending_ref(&self) -> i64 {
        -(self.pending.len() as i64) - 1
    }

    fn push_pending(&mut self, entry: IndexEntry) {
        self.pending.push(entry);
    }

    fn pending_slot(reference: i64) -> usize {
        (-reference - 1) as usize
    }

    fn load(&mut self, position: i64) -> Result<()> {
        if position >= 0 && !self.disk.contains_key(&position) {
            let item = self.store.get(position as u64)?;
            let value = item.value.unwrap_or(serde_json::Value::Null);
            let entry = IndexEntry::parse(item.start, &value)
                .wrap_err_with(|| format!("bad index entry at offset {position}"))?;
            self.disk.insert(position, entry);
        }
        Ok(())
    }

    fn entry(&mut self, reference: i64) -> Result<&IndexEntry> {
        if reference < 0 {
            let slot = Self::pending_slot(reference);
            return self.pending.get(slot).ok_or_else(|| {
                JifyError::InvalidFormat(format!("dangling pending reference {reference}")).into()
            });
        }
        self.load(reference)?;
        Ok(&self.disk[&reference])
    }

    fn entry_mut(&mut self, reference: i64) -> Result<&mut IndexEntry> {
        if reference < 0 {
            let slot = Self::pending_slot(reference);
            return self.pending.get_mut(slot).ok_or_else(|| {
                JifyError::InvalidFormat(format!("dangling pending reference {reference}")).into()
            });
        }
        self.load(reference)?;
        self.touched.insert(reference);
        Ok(self
            .disk
            .get_mut(&reference)
            .expect("loaded above")) // INVARIANT: load inserted the entry
    }

    fn disk_entry(&self, position: i64) -> Result<&IndexEntry> {
        self.disk.get(&position).ok_or_else(|| {
            JifyError::InvalidFormat(format!("untracked touched entry at offset {position}")).into()
        })
    }

    fn level_of(&mut self, reference: i64, level: usize) -> Result<i64> {
        Ok(self.entry(reference)?.level(level))
    }

    fn value_of(&mut self, reference: i64) -> Result<Value> {
        let entry = self.entry(reference)?;
        match entry.value() {
            Some(value) => Ok(value.clone()),
            None => Err(JifyError::InvalidFormat(format!(
                "entry at offset {} has no value",
                entry.position
            ))
            .into()),
        }
    }

    fn link_of(&mut self, reference: i64) -> Result<i64> {
        Ok(self.entry(reference)?.link)
    }

    fn pointer_of(&mut self, reference: i64) -> Result<u64> {
        Ok(self.entry(reference)?.pointer)
    }

    fn set_level(&mut self, reference: i64, level: usize, target: i64) -> Result<()> {
        self.entry_mut(reference)?.set_level(level, target)
    }

    fn set_link(&mut self, reference: i64, target: i64) -> Result<()> {
        self.entry_mut(reference)?.link = target;
        Ok(())
    }
}

/// Clones an entry with every offset reference passed through `map`.
fn substitute(
    entry: &IndexEntry,
    map: impl Fn(i64) -> Result<i64>,
) -> Result<IndexEntry> {
    let mut out = entry.clone();
    out.link = map(out.link)?;
    if let Some(node) = &mut out.node {
        for level in node.levels.iter_mut() {
            *level = map(*level)?;
        }
    }
    Ok(out)
}

fn resolve_slot(reference: i64, offsets: &[u64]) -> Result<i64> {
    if reference >= 0 {
        return Ok(reference);
    }
    let slot = EntryCache::pending_slot(reference);
    match offsets.get(slot) {
        Some(offset) => Ok(*offset as i64),
        None => Err(JifyError::InvalidFormat(format!(
            "pending reference {reference} has no assigned offset"
        ))
        .into()),
    }
}
