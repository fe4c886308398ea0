//! # Indexable Value Model
//!
//! A skip-list entry stores one scalar JSON value: null, a boolean, a finite
//! double, or a string. Arrays and objects are not indexable and are skipped
//! when collecting field values from a record.
//!
//! ## Ordering
//!
//! Values of mixed types within one field are given a total order by ranking
//! the type first and comparing naturally within a rank:
//!
//! ```text
//! null < booleans < numbers < strings
//! ```
//!
//! The rank doubles as the on-disk type tag (0..=3) of the encoded node.
//!
//! ## Date-time coercion
//!
//! Fields registered with the `date-time` type store the parsed epoch
//! milliseconds instead of the original string, so range queries compare
//! numerically. [`parse_date`] accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, and
//! bare `YYYY-MM-DD` (midnight UTC).

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use eyre::Result;
use serde_json::Value as Json;

use crate::error::JifyError;

/// A scalar value held by an index entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    /// On-disk type tag: 0 null, 1 bool, 2 number, 3 string.
    pub fn type_tag(&self) -> u32 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
        }
    }

    /// Extracts an indexable scalar from a JSON value. Arrays and objects
    /// return `None`.
    pub fn from_json(json: &Json) -> Option<Value> {
        match json {
            Json::Null => Some(Value::Null),
            Json::Bool(b) => Some(Value::Bool(*b)),
            Json::Number(n) => n.as_f64().map(Value::Number),
            Json::String(s) => Some(Value::String(s.clone())),
            Json::Array(_) | Json::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        self.type_tag() as u8
    }

    /// Total order over mixed-type values: rank first, natural order within
    /// a rank. Numbers are finite by construction, so `partial_cmp` cannot
    /// fail on values that round-tripped through the store.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

/// Parses a date-time string to epoch milliseconds.
pub fn parse_date(text: &str) -> Option<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis() as f64);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis() as f64);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(midnight.and_utc().timestamp_millis() as f64);
    }
    None
}

/// Coerces a value of a `date-time` field to its numeric comparison form.
/// Numbers pass through unchanged (already epoch millis); strings must parse
/// as a date.
pub fn coerce_date(value: &Value) -> Result<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(text) => match parse_date(text) {
            Some(millis) => Ok(Value::Number(millis)),
            None => Err(JifyError::InvalidFormat(format!(
                "unparsable date-time value '{text}'"
            ))
            .into()),
        },
        other => Err(JifyError::InvalidFormat(format!(
            "date-time field holds a non-date value {other:?}"
        ))
        .into()),
    }
}
