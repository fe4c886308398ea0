//! # Index Entries
//!
//! One line of the index file is a single-key JSON object
//! `{"<field>": "<payload>"}` whose payload packs a skip-list entry:
//!
//! ```text
//! z85(pointer) ';' z85(link) ';' levels ';' z85(tag) ';' value
//! \_________ fixed 5 chars _________/  \______ node ________/
//! ```
//!
//! - `pointer`: record offset in the data file (0 on the root and on field
//!   headers)
//! - `link`: offset of the next entry in this entry's chain (the next
//!   field header from the root or a header, the next value-equal duplicate
//!   from a value entry)
//! - `levels`: comma-separated forward offsets, one per skip-list level;
//!   empty on the root, 32 slots on field headers
//! - `tag`/`value`: the indexed scalar (see [`crate::types::Value`]); field
//!   headers store their metadata JSON in the string slot
//!
//! Duplicate entries carry no node at all (`pointer;link;`): they hang off
//! their primary's `link` chain and never participate in the leveled lists.
//!
//! ## In-Place Rewrites
//!
//! Splicing a batch rewrites predecessors' `link` and `levels` fields, and
//! transactions flip the `tx` digit inside header metadata. Every rewritten
//! field is fixed-width (5-char Z85 integers, one-digit tx), so an updated
//! entry re-serializes to exactly its original byte length and is written
//! back over itself.
//!
//! During a batch insert, entries not yet on disk are referenced by negative
//! placeholder positions (`-1 - slot`); the write phase substitutes real
//! offsets once the append cursor is known. Serialization rejects leftover
//! placeholders.

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

use crate::encoding::z85;
use crate::error::JifyError;
use crate::types::Value;

/// Maximum skip-list height; field headers always carry this many levels.
pub const MAX_HEIGHT: usize = 32;

pub type LevelVec = SmallVec<[i64; 4]>;

/// Per-field metadata stored in a header's value slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    pub tx: u8,
}

impl FieldMeta {
    pub const DATE_TIME: &'static str = "date-time";

    pub fn is_date_time(&self) -> bool {
        self.kind.as_deref() == Some(Self::DATE_TIME)
    }
}

/// The leveled part of an entry plus its indexed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub levels: LevelVec,
    pub value: Value,
}

impl Node {
    fn encode(&self) -> Result<String> {
        let mut out = String::new();
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&z85::encode_u32(offset_u32(*level)?));
        }
        out.push(';');
        out.push_str(&z85::encode_u32_compact(self.value.type_tag()));
        out.push(';');
        match &self.value {
            Value::Null => {}
            Value::Bool(b) => out.push_str(&z85::encode_u32_compact(*b as u32)),
            Value::Number(n) => out.push_str(&z85::encode_f64(*n)?),
            Value::String(s) => out.push_str(s),
        }
        Ok(out)
    }

    fn parse(text: &str) -> Result<Node> {
        let mut parts = text.splitn(3, ';');
        let levels_csv = parts.next().unwrap_or("");
        let Some(tag_text) = parts.next() else {
            bail!(JifyError::InvalidFormat(format!(
                "entry node lacks a type tag: '{text}'"
            )));
        };
        let value_text = parts.next().unwrap_or("");

        let mut levels = LevelVec::new();
        if !levels_csv.is_empty() {
            for piece in levels_csv.split(',') {
                levels.push(z85::decode_u32(piece)? as i64);
            }
        }
        let value = match z85::decode_u32(tag_text)? {
            0 => Value::Null,
            1 => Value::Bool(z85::decode_u32(value_text)? != 0),
            2 => Value::Number(z85::decode_f64(value_text)?),
            3 => Value::String(value_text.to_string()),
            tag => bail!(JifyError::InvalidFormat(format!(
                "unknown entry type tag {tag}"
            ))),
        };
        Ok(Node { levels, value })
    }
}

/// One entry of the index file: the root, a field header, a value entry, or
/// a value-equal duplicate.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Byte offset of this entry in the index file; negative while the entry
    /// is a pending member of a batch.
    pub position: i64,
    /// JSON key of the line: the owning field's name, empty on the root.
    pub label: String,
    /// Record offset in the data file (0 on root and headers).
    pub pointer: u64,
    /// Next entry in this entry's chain; 0 terminates.
    pub link: i64,
    /// `None` marks a duplicate entry.
    pub node: Option<Node>,
}

impl IndexEntry {
    /// The root entry written at index creation.
    pub fn root() -> IndexEntry {
        IndexEntry {
            position: 0,
            label: String::new(),
            pointer: 0,
            link: 0,
            node: Some(Node {
                levels: LevelVec::new(),
                value: Value::Null,
            }),
        }
    }

    /// A field header: 32 zeroed levels and the metadata JSON as its value.
    pub fn field_header(meta: &FieldMeta) -> Result<IndexEntry> {
        let metadata = serde_json::to_string(meta)
            .map_err(|err| JifyError::InvalidFormat(format!("unserializable metadata: {err}")))?;
        Ok(IndexEntry {
            position: 0,
            label: meta.name.clone(),
            pointer: 0,
            link: 0,
            node: Some(Node {
                levels: SmallVec::from_elem(0, MAX_HEIGHT),
                value: Value::String(metadata),
            }),
        })
    }

    /// Parses the header metadata out of the value slot.
    pub fn meta(&self) -> Result<FieldMeta> {
        let Some(Node {
            value: Value::String(text),
            ..
        }) = &self.node
        else {
            bail!(JifyError::InvalidFormat(format!(
                "entry at offset {} is not a field header",
                self.position
            )));
        };
        serde_json::from_str(text).map_err(|err| {
            JifyError::InvalidFormat(format!(
                "unparsable field metadata at offset {}: {err}",
                self.position
            ))
            .into()
        })
    }

    /// Replaces the header metadata; the new serialization must keep the
    /// original byte length (only the tx digit ever changes).
    pub fn set_meta(&mut self, meta: &FieldMeta) -> Result<()> {
        let metadata = serde_json::to_string(meta)
            .map_err(|err| JifyError::InvalidFormat(format!("unserializable metadata: {err}")))?;
        let Some(node) = &mut self.node else {
            bail!(JifyError::InvalidFormat(format!(
                "entry at offset {} is not a field header",
                self.position
            )));
        };
        node.value = Value::String(metadata);
        Ok(())
    }

    pub fn levels_len(&self) -> usize {
        self.node.as_ref().map_or(0, |node| node.levels.len())
    }

    /// Forward offset at a level; absent levels read as 0 (chain end).
    pub fn level(&self, level: usize) -> i64 {
        self.node
            .as_ref()
            .and_then(|node| node.levels.get(level).copied())
            .unwrap_or(0)
    }

    pub fn set_level(&mut self, level: usize, target: i64) -> Result<()> {
        match &mut self.node {
            Some(node) if level < node.levels.len() => {
                node.levels[level] = target;
                Ok(())
            }
            _ => bail!(JifyError::InvalidFormat(format!(
                "entry at offset {} has no level {level}",
                self.position
            ))),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.node.as_ref().map(|node| &node.value)
    }

    /// Serialized payload (the JSON string value of the line).
    pub fn encode_payload(&self) -> Result<String> {
        let pointer = u32::try_from(self.pointer).map_err(|_| {
            JifyError::InvalidFormat(format!("record offset {} exceeds 32 bits", self.pointer))
        })?;
        let mut out = String::with_capacity(16);
        out.push_str(&z85::encode_u32(pointer));
        out.push(';');
        out.push_str(&z85::encode_u32(offset_u32(self.link)?));
        out.push(';');
        if let Some(node) = &self.node {
            out.push_str(&node.encode()?);
        }
        Ok(out)
    }

    /// The full JSON line: `{"<label>": "<payload>"}`.
    pub fn to_json(&self) -> Result<Json> {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(self.label.clone(), Json::String(self.encode_payload()?));
        Ok(Json::Object(map))
    }

    /// Parses one index-file element located at `position`.
    pub fn parse(position: u64, element: &Json) -> Result<IndexEntry> {
        let Some(object) = element.as_object() else {
            bail!(JifyError::InvalidFormat(format!(
                "index element at offset {position} is not an object"
            )));
        };
        ensure!(
            object.len() == 1,
            JifyError::InvalidFormat(format!(
                "index element at offset {position} must have exactly one key"
            ))
        );
        let (label, payload) = object
            .iter()
            .next()
            .expect("len checked above"); // INVARIANT: object.len() == 1
        let Some(payload) = payload.as_str() else {
            bail!(JifyError::InvalidFormat(format!(
                "index element at offset {position} has a non-string payload"
            )));
        };
        Self::parse_payload(position, label, payload)
    }

    pub fn parse_payload(position: u64, label: &str, payload: &str) -> Result<IndexEntry> {
        let (pointer_text, link_text, rest) = match (
            payload.get(..z85::U32_WIDTH),
            payload.get(z85::U32_WIDTH..=z85::U32_WIDTH),
            payload.get(z85::U32_WIDTH + 1..2 * z85::U32_WIDTH + 1),
            payload.get(2 * z85::U32_WIDTH + 1..=2 * z85::U32_WIDTH + 1),
            payload.get(2 * z85::U32_WIDTH + 2..),
        ) {
            (Some(pointer), Some(";"), Some(link), Some(";"), Some(rest)) => {
                (pointer, link, rest)
            }
            _ => bail!(JifyError::InvalidFormat(format!(
                "malformed entry payload at offset {position}: '{payload}'"
            ))),
        };
        let pointer = z85::decode_u32(pointer_text)? as u64;
        let link = z85::decode_u32(link_text)? as i64;
        let node = if rest.is_empty() {
            None
        } else {
            Some(Node::parse(rest)?)
        };
        Ok(IndexEntry {
            position: position as i64,
            label: label.to_string(),
            pointer,
            link,
            node,
        })
    }
}

fn offset_u32(offset: i64) -> Result<u32> {
    ensure!(
        offset >= 0,
        JifyError::InvalidFormat(format!("unresolved placeholder offset {offset}"))
    );
    u32::try_from(offset).map_err(|_| {
        JifyError::InvalidFormat(format!("index offset {offset} exceeds 32 bits")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn line_length(entry: &IndexEntry) -> usize {
        serde_json::to_string(&entry.to_json().unwrap()).unwrap().len()
    }

    #[test]
    fn root_payload_shape() {
        let root = IndexEntry::root();
        assert_eq!(root.encode_payload().unwrap(), "00000;00000;;0;");
    }

    #[test]
    fn value_entry_round_trips() {
        let entry = IndexEntry {
            position: 377,
            label: "age".into(),
            pointer: 120,
            link: 0,
            node: Some(Node {
                levels: smallvec![900, 0, 1400],
                value: Value::Number(42.0),
            }),
        };
        let payload = entry.encode_payload().unwrap();
        let parsed = IndexEntry::parse_payload(377, "age", &payload).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn string_value_with_separators_round_trips() {
        let entry = IndexEntry {
            position: 9,
            label: "name".into(),
            pointer: 4,
            link: 0,
            node: Some(Node {
                levels: smallvec![0],
                value: Value::String("semi;colon,comma\"quote".into()),
            }),
        };
        let json = entry.to_json().unwrap();
        let parsed = IndexEntry::parse(9, &json).unwrap();
        assert_eq!(parsed.value(), Some(&Value::String("semi;colon,comma\"quote".into())));
    }

    #[test]
    fn duplicate_entry_has_no_node() {
        let dup = IndexEntry {
            position: 55,
            label: "age".into(),
            pointer: 200,
            link: 31,
            node: None,
        };
        let payload = dup.encode_payload().unwrap();
        assert!(payload.ends_with(';'));
        assert_eq!(payload.len(), 12);
        let parsed = IndexEntry::parse_payload(55, "age", &payload).unwrap();
        assert_eq!(parsed.node, None);
        assert_eq!(parsed.link, 31);
        assert_eq!(parsed.pointer, 200);
    }

    #[test]
    fn header_metadata_round_trips() {
        let meta = FieldMeta {
            name: "born".into(),
            kind: Some(FieldMeta::DATE_TIME.into()),
            tx: 0,
        };
        let header = IndexEntry::field_header(&meta).unwrap();
        assert_eq!(header.levels_len(), MAX_HEIGHT);
        assert_eq!(header.meta().unwrap(), meta);
        assert!(header.meta().unwrap().is_date_time());
    }

    #[test]
    fn metadata_omits_absent_type() {
        let meta = FieldMeta {
            name: "age".into(),
            kind: None,
            tx: 0,
        };
        assert_eq!(
            serde_json::to_string(&meta).unwrap(),
            r#"{"name":"age","tx":0}"#
        );
    }

    #[test]
    fn tx_flip_preserves_line_length() {
        let meta = FieldMeta {
            name: "age".into(),
            kind: None,
            tx: 0,
        };
        let mut header = IndexEntry::field_header(&meta).unwrap();
        let before = line_length(&header);

        let mut flipped = meta.clone();
        flipped.tx = 1;
        header.set_meta(&flipped).unwrap();
        assert_eq!(line_length(&header), before);
        assert_eq!(header.meta().unwrap().tx, 1);
    }

    #[test]
    fn link_and_level_rewrites_preserve_line_length() {
        let entry = IndexEntry {
            position: 20,
            label: "id".into(),
            pointer: 7,
            link: 0,
            node: Some(Node {
                levels: smallvec![0, 0],
                value: Value::String("k-000017".into()),
            }),
        };
        let before = line_length(&entry);

        let mut rewritten = entry.clone();
        rewritten.link = i64::from(u32::MAX);
        rewritten.set_level(0, 123_456).unwrap();
        rewritten.set_level(1, 7).unwrap();
        assert_eq!(line_length(&rewritten), before);
    }

    #[test]
    fn pending_placeholders_refuse_to_serialize() {
        let mut entry = IndexEntry::root();
        entry.link = -3;
        assert!(entry.encode_payload().is_err());
    }

    #[test]
    fn malformed_payloads_are_invalid_format() {
        for payload in ["", "short", "00000;00000", "00000X00000;;0;"] {
            let err = IndexEntry::parse_payload(0, "f", payload).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<JifyError>(),
                    Some(JifyError::InvalidFormat(_))
                ),
                "payload {payload:?}"
            );
        }
    }

    #[test]
    fn set_level_outside_height_fails() {
        let mut entry = IndexEntry {
            position: 0,
            label: "f".into(),
            pointer: 0,
            link: 0,
            node: Some(Node {
                levels: smallvec![0],
                value: Value::Null,
            }),
        };
        assert!(entry.set_level(0, 5).is_ok());
        assert!(entry.set_level(1, 5).is_err());
    }
}
