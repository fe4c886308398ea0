//! # Query-String Parser
//!
//! Turns the CLI form `field<op>value[,field<op>value…]` into a [`Query`].
//! Conditions on the same field merge into one predicate; one `--query`
//! argument is a conjunction, several form a disjunction at the database
//! level.
//!
//! Values parse as JSON literals (`42`, `true`, `null`, `"quoted"`); raw
//! text that is not a JSON literal is taken as a bare string, so
//! `name=John` works without quoting.

use eyre::{ensure, Result};
use serde_json::Value as Json;

use crate::database::Query;
use crate::error::JifyError;
use crate::index::{Op, Predicate};
use crate::types::Value;

/// Parses one `--query` argument.
pub fn parse_query(text: &str) -> Result<Query> {
    let mut fields: Vec<(String, Predicate)> = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        ensure!(
            !part.is_empty(),
            JifyError::PredicateInvalid(format!("empty condition in '{text}'"))
        );
        let (field, op, value) = parse_condition(part)?;
        match fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, predicate)) => {
                *predicate = predicate.clone().condition(op, value);
            }
            None => fields.push((field.to_string(), Predicate::new(vec![]).condition(op, value))),
        }
    }
    ensure!(
        !fields.is_empty(),
        JifyError::PredicateInvalid(format!("no conditions in '{text}'"))
    );
    let mut query = Query::new();
    for (field, predicate) in fields {
        query = query.field(field, predicate);
    }
    Ok(query)
}

fn parse_condition(part: &str) -> Result<(&str, Op, Value)> {
    let Some(split) = part.find(['<', '>', '=']) else {
        return Err(JifyError::PredicateInvalid(format!(
            "no operator in condition '{part}'"
        ))
        .into());
    };
    let field = part[..split].trim();
    ensure!(
        !field.is_empty(),
        JifyError::PredicateInvalid(format!("no field name in condition '{part}'"))
    );
    let rest = &part[split..];
    let (op, value_text) = if let Some(value) = rest.strip_prefix("<=") {
        (Op::Le, value)
    } else if let Some(value) = rest.strip_prefix(">=") {
        (Op::Ge, value)
    } else if let Some(value) = rest.strip_prefix('<') {
        (Op::Lt, value)
    } else if let Some(value) = rest.strip_prefix('>') {
        (Op::Gt, value)
    } else if let Some(value) = rest.strip_prefix('=') {
        (Op::Eq, value)
    } else {
        return Err(
            JifyError::PredicateInvalid(format!("bad operator in condition '{part}'")).into(),
        );
    };
    let value_text = value_text.trim();
    ensure!(
        !value_text.is_empty(),
        JifyError::PredicateInvalid(format!("no value in condition '{part}'"))
    );
    Ok((field, op, parse_literal(value_text)))
}

fn parse_literal(text: &str) -> Value {
    match serde_json::from_str::<Json>(text) {
        Ok(json) => Value::from_json(&json).unwrap_or_else(|| Value::String(text.to_string())),
        Err(_) => Value::String(text.to_string()),
    }
}
