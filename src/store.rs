//! # JSON Array Store
//!
//! Treats one file as a JSON array of elements and provides the append-only
//! byte discipline the rest of the engine builds on.
//!
//! ## On-Disk Shape
//!
//! ```text
//! [
//!   {"name": "John", "age": 42},
//!   {"name": "Jane", "age": 17}
//! ]
//! ```
//!
//! Elements are joined by `",\n" + indent` and the file always ends with the
//! trailer `"\n]\n"`. An element's offset is the byte position of its first
//! character, which is stable forever: elements are never moved or removed.
//! The index file uses the same store with indent 0, one element per line.
//!
//! ## Append Protocol
//!
//! [`JsonStore::append_position`] scans the tail backwards for the closing
//! `]` and returns the byte to start overwriting plus whether the array is
//! still empty (the next significant byte behind the `]` is the opening
//! `[`). [`JsonStore::append_raw`] then writes `joiner + raw + "\n]\n"` at
//! that position. Because the trailer is rewritten by every append, any
//! successful append leaves a file that parses as a complete JSON array,
//! and a torn append is healed by the next one, which re-derives the
//! position from the last intact trailer.
//!
//! ## Read Paths
//!
//! `get` scans one element at a known offset; `iter` walks all elements
//! lazily. A file that does not begin with `[` is read as line-delimited
//! JSON (elements separated by whitespace, no brackets).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::JifyError;
use crate::json::{scan_value, ScanItem};
use crate::storage::{ByteReader, ExclusiveLock, LockedFile, SharedLock, DEFAULT_CHUNK_SIZE};

/// Trailing bytes of every store file.
pub const TRAILER: &str = "\n]\n";

/// Store-level tuning: data files default to a two-space indent; the index
/// store pins indent 0 (one element per line).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub indent: usize,
    pub chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            indent: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }
}

#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    file: LockedFile,
    indent_pad: String,
    chunk: usize,
}

impl JsonStore {
    /// Creates the file exclusively and writes the given elements.
    pub fn create<P: AsRef<Path>>(
        path: P,
        elements: &[Json],
        config: &StoreConfig,
    ) -> Result<Self> {
        let file = LockedFile::create_new(&path)?;
        let store = Self {
            path: path.as_ref().to_path_buf(),
            file,
            indent_pad: " ".repeat(config.indent),
            chunk: config.chunk_size,
        };
        let mut out = String::from("[");
        for (i, element) in elements.iter().enumerate() {
            out.push_str(&store.joiner(i == 0));
            out.push_str(&store.stringify(element)?);
        }
        out.push_str(TRAILER);
        store.file.append(&out)?;
        store.file.sync()?;
        Ok(store)
    }

    /// Opens an existing store file.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let file = LockedFile::open(&path)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            indent_pad: " ".repeat(config.indent),
            chunk: config.chunk_size,
        })
    }

    /// Deletes the store file.
    pub fn destroy(self) -> Result<()> {
        LockedFile::remove(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &LockedFile {
        &self.file
    }

    pub fn indent(&self) -> usize {
        self.indent_pad.len()
    }

    pub fn modified(&self) -> Result<SystemTime> {
        self.file.modified()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Joiner written before an element: `",\n" + indent`, or without the
    /// comma for the first element of the array.
    pub fn joiner(&self, first: bool) -> String {
        if first {
            format!("\n{}", self.indent_pad)
        } else {
            format!(",\n{}", self.indent_pad)
        }
    }

    pub fn joiner_len(&self, first: bool) -> u64 {
        (if first { 1 } else { 2 } + self.indent_pad.len()) as u64
    }

    /// Serializes one element the way this store formats it: indented with
    /// continuation lines shifted by one level, or compact at indent 0.
    pub fn stringify(&self, value: &Json) -> Result<String> {
        if self.indent_pad.is_empty() {
            return serde_json::to_string(value).wrap_err("failed to serialize element");
        }
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(self.indent_pad.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value
            .serialize(&mut serializer)
            .wrap_err("failed to serialize element")?;
        let text = String::from_utf8(buf)
            .map_err(|_| JifyError::InvalidFormat("serializer produced invalid UTF-8".into()))?;
        // serde escapes newlines inside strings, so every literal newline is
        // structural and safe to re-indent
        Ok(text.replace('\n', &format!("\n{}", self.indent_pad)))
    }

    /// Scans the element at a byte offset.
    pub fn get(&self, position: u64) -> Result<ScanItem> {
        let mut reader = ByteReader::new(&self.file, position as i64, false, self.chunk)?;
        match scan_value(&mut reader, true)? {
            Some(item) => Ok(item),
            None => Err(JifyError::NotFound(format!(
                "no element at offset {position} of '{}'",
                self.path.display()
            ))
            .into()),
        }
    }

    /// Lazily iterates `(offset, value)` for every element. Accepts both the
    /// canonical bracketed form and line-delimited JSON, detected by the
    /// first byte.
    pub fn iter(&self) -> Result<Elements<'_>> {
        let mut head = [0u8; 1];
        let read = self.file.read_at(&mut head, 0)?;
        let start = if read > 0 && head[0] == b'[' { 1 } else { 0 };
        Ok(Elements {
            reader: ByteReader::new(&self.file, start, false, self.chunk)?,
        })
    }

    /// Locates where the next append must start writing. Scans the tail
    /// backwards past whitespace for the closing `]`; `first` reports
    /// whether the array is still empty. A tail without `]` is
    /// `InvalidFormat`.
    pub fn append_position(&self) -> Result<(u64, bool)> {
        let mut reader = ByteReader::new(&self.file, -1, true, self.chunk)?;
        let bracket = loop {
            match reader.next_char()? {
                None => {
                    return Err(JifyError::InvalidFormat(format!(
                        "'{}' has no closing ]",
                        self.path.display()
                    ))
                    .into())
                }
                Some((_, ch)) if matches!(ch, ' ' | '\t' | '\n' | '\r') => continue,
                Some((offset, ']')) => break offset,
                Some((_, ch)) => {
                    return Err(JifyError::InvalidFormat(format!(
                        "'{}' ends with {ch:?} instead of ]",
                        self.path.display()
                    ))
                    .into())
                }
            }
        };
        let mut first = false;
        let mut open_offset = None;
        loop {
            match reader.next_char()? {
                None => break,
                Some((_, ch)) if matches!(ch, ' ' | '\t' | '\n' | '\r') => continue,
                Some((offset, '[')) => {
                    first = true;
                    open_offset = Some(offset);
                    break;
                }
                Some(_) => break,
            }
        }
        // keep the opening bracket when it sits directly against the `]`
        let position = match open_offset {
            Some(open) if open + 1 == bracket => bracket,
            _ => bracket.saturating_sub(1),
        };
        Ok((position, first))
    }

    /// Appends one pre-serialized element (or a pre-joined run of elements).
    /// Returns `(start, length)` of the written text.
    pub fn append_raw(
        &self,
        raw: &str,
        position: Option<u64>,
        first: Option<bool>,
    ) -> Result<(u64, u64)> {
        let (position, first) = match position {
            Some(position) => (position, first.unwrap_or(false)),
            None => self.append_position()?,
        };
        let joiner = self.joiner(first);
        let mut out = String::with_capacity(joiner.len() + raw.len() + TRAILER.len());
        out.push_str(&joiner);
        out.push_str(raw);
        out.push_str(TRAILER);
        self.file.write_at(out.as_bytes(), position)?;
        self.file.sync()?;
        Ok((position + joiner.len() as u64, raw.len() as u64))
    }

    /// Serializes and appends one element; returns `(start, length)`.
    pub fn append(&self, value: &Json) -> Result<(u64, u64)> {
        let raw = self.stringify(value)?;
        self.append_raw(&raw, None, None)
    }

    /// Raw positioned overwrite. Does not sync; batch callers sync once.
    pub fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        self.file.write_at(buf, position)
    }

    /// Rewrites the element at `position` in place. The serialized form must
    /// have the same byte length as the element it replaces; entry payloads
    /// guarantee this by fixing the width of every mutable field.
    pub fn set(&self, position: u64, value: &Json) -> Result<()> {
        let raw = self.stringify(value)?;
        self.write(raw.as_bytes(), position)
    }

    pub fn lock_shared(&self, position: u64) -> Result<SharedLock<'_>> {
        self.file.lock_shared(position)
    }

    pub fn lock_exclusive(&self, position: u64) -> Result<ExclusiveLock<'_>> {
        self.file.lock_exclusive(position)
    }
}

/// Lazy iterator over the elements of a store file.
#[derive(Debug)]
pub struct Elements<'a> {
    reader: ByteReader<'a>,
}

impl Iterator for Elements<'_> {
    type Item = Result<(u64, Json)>;

    fn next(&mut self) -> Option<Self::Item> {
        match scan_value(&mut self.reader, true) {
            Ok(None) => None,
            Ok(Some(item)) => {
                let value = item.value.unwrap_or(Json::Null);
                Some(Ok((item.start, value)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
