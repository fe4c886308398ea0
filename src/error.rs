//! # Error Kinds
//!
//! Fallible paths throughout the crate return `eyre::Result`. Failures that a
//! caller can act on programmatically carry a [`JifyError`] at the bottom of
//! the report chain; decision sites recover the kind with
//! `report.downcast_ref::<JifyError>()` while the CLI prints the full chain.
//!
//! Raw filesystem failures stay as `std::io::Error` inside the report. Lock
//! contention is handled internally by blocking and never surfaces as an
//! error.

use thiserror::Error;

/// Failure kinds a caller can dispatch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JifyError {
    /// A data or index file required by the operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Exclusive creation hit an existing file.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// On-disk bytes do not follow the expected format: a data file without a
    /// closing `]`, a Z85 string of the wrong length, a non-finite number, an
    /// unparsable entry payload.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The operation referenced a field with no header in the index.
    #[error("field is not indexed: {0}")]
    FieldMissing(String),

    /// The field header carries `tx=1`; a build is in progress or a previous
    /// one crashed, and the field must be rebuilt before reads.
    #[error("field has an index build in progress: {0}")]
    FieldInTransaction(String),

    /// A query string or predicate could not be understood.
    #[error("invalid query: {0}")]
    PredicateInvalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_eyre_wrapping() {
        let report: eyre::Report = JifyError::FieldMissing("age".into()).into();
        assert!(matches!(
            report.downcast_ref::<JifyError>(),
            Some(JifyError::FieldMissing(f)) if f == "age"
        ));
    }

    #[test]
    fn display_includes_subject() {
        let err = JifyError::AlreadyExists("db.json".into());
        assert_eq!(err.to_string(), "already exists: db.json");
    }
}
