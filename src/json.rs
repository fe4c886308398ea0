//! # JSON Element Scanner
//!
//! Finds the exact byte range of one JSON value inside a byte stream without
//! materializing the document around it. Given a reader positioned at (or in
//! the whitespace before) a value, [`scan_value`] classifies the first
//! significant character and walks to the value's end:
//!
//! - objects/arrays: depth counting, with string state so braces inside
//!   strings are ignored; the closing delimiter is part of the length
//! - strings: escape-aware scan to the closing quote
//! - primitives: scan to the first terminator (whitespace, `,`, `}`, `]`),
//!   which is not part of the length
//!
//! A `]` or end-of-input where a value would start yields `Ok(None)`, which
//! is how the store's iterator detects the end of the array. The reader is
//! left just past the value, so repeated calls over one reader iterate the
//! elements of an array (or of a line-delimited file) without re-reading.

use eyre::Result;
use serde_json::Value as Json;

use crate::error::JifyError;
use crate::storage::ByteReader;

/// One located element: byte range plus the parsed value when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanItem {
    pub start: u64,
    pub length: u64,
    pub value: Option<Json>,
}

fn is_json_space(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r')
}

/// Scans the next JSON value. Returns `Ok(None)` when the stream ends or the
/// enclosing array closes before a value starts.
pub fn scan_value(reader: &mut ByteReader<'_>, parse: bool) -> Result<Option<ScanItem>> {
    let (start, first) = loop {
        match reader.next_char()? {
            None => return Ok(None),
            Some((_, ch)) if is_json_space(ch) || ch == ',' => continue,
            Some((_, ']')) => return Ok(None),
            Some((offset, ch)) => break (offset, ch),
        }
    };

    let mut text = String::new();
    if parse {
        text.push(first);
    }
    let mut end = start + first.len_utf8() as u64;

    match first {
        '{' | '[' => {
            let mut depth = 1u32;
            let mut in_string = false;
            let mut escaping = false;
            while depth > 0 {
                let Some((offset, ch)) = reader.next_char()? else {
                    return Err(JifyError::InvalidFormat(format!(
                        "unterminated JSON value starting at offset {start}"
                    ))
                    .into());
                };
                if parse {
                    text.push(ch);
                }
                end = offset + ch.len_utf8() as u64;
                if in_string {
                    if escaping {
                        escaping = false;
                    } else if ch == '\\' {
                        escaping = true;
                    } else if ch == '"' {
                        in_string = false;
                    }
                } else {
                    match ch {
                        '"' => in_string = true,
                        '{' | '[' => depth += 1,
                        '}' | ']' => depth -= 1,
                        _ => {}
                    }
                }
            }
        }
        '"' => {
            let mut escaping = false;
            loop {
                let Some((offset, ch)) = reader.next_char()? else {
                    return Err(JifyError::InvalidFormat(format!(
                        "unterminated JSON string starting at offset {start}"
                    ))
                    .into());
                };
                if parse {
                    text.push(ch);
                }
                end = offset + ch.len_utf8() as u64;
                if escaping {
                    escaping = false;
                } else if ch == '\\' {
                    escaping = true;
                } else if ch == '"' {
                    break;
                }
            }
        }
        _ => loop {
            match reader.next_char()? {
                None => break,
                Some((_, ch)) if is_json_space(ch) || matches!(ch, ',' | '}' | ']') => break,
                Some((offset, ch)) => {
                    if parse {
                        text.push(ch);
                    }
                    end = offset + ch.len_utf8() as u64;
                }
            }
        },
    }

    let value = if parse {
        Some(serde_json::from_str(&text).map_err(|err| {
            JifyError::InvalidFormat(format!("unparsable JSON at offset {start}: {err}"))
        })?)
    } else {
        None
    };

    Ok(Some(ScanItem {
        start,
        length: end - start,
        value,
    }))
}
