//! # Command-Line Front-End
//!
//! Subcommand dispatch for the `jify` binary:
//!
//! ```text
//! jify create FILE [--field NAME[:TYPE]]...
//! jify insert FILE [JSON]...          # records from args, or stdin lines
//! jify index  FILE --field NAME[:TYPE] [--field ...]
//! jify find   FILE --query "field<op>value[,...]" [--query ...]
//! jify drop   FILE
//! ```
//!
//! Operators are `=`, `<`, `>`, `<=`, `>=`; several `--query` arguments form
//! a disjunction. Matching records print one per line as compact JSON.

pub mod query;

use std::io::BufRead;

use eyre::{bail, ensure, Result, WrapErr};
use serde_json::Value as Json;

use crate::database::{Database, Query};
use crate::error::JifyError;
use crate::index::FieldSpec;

pub const USAGE: &str = "\
jify - append-only JSON document database with indexed lookups

Usage:
  jify create FILE [--field NAME[:TYPE]]...
  jify insert FILE [JSON]...
  jify index  FILE --field NAME[:TYPE] [--field NAME[:TYPE]]...
  jify find   FILE --query QUERY [--query QUERY]...
  jify drop   FILE
  jify --help | --version

Options:
  --field NAME[:TYPE]   Field to index; TYPE may be 'date-time'
  --query QUERY         Conditions like \"age>=18,age<35\" (AND within a
                        query, OR across repeated --query arguments)

With no JSON arguments, 'insert' reads one record per stdin line.
Set DEBUG to a non-empty value for diagnostics on stderr.";

/// Runs one invocation; `args` excludes the program name.
pub fn run(args: &[String]) -> Result<()> {
    let Some(command) = args.first() else {
        println!("{USAGE}");
        return Ok(());
    };
    match command.as_str() {
        "--help" | "-h" | "help" => {
            println!("{USAGE}");
            Ok(())
        }
        "--version" | "-v" => {
            println!("jify {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "create" => cmd_create(&args[1..]),
        "insert" => cmd_insert(&args[1..]),
        "index" => cmd_index(&args[1..]),
        "find" => cmd_find(&args[1..]),
        "drop" => cmd_drop(&args[1..]),
        other => bail!("unknown command '{other}' (try --help)"),
    }
}

fn split_file_arg<'a>(args: &'a [String], command: &str) -> Result<(&'a str, &'a [String])> {
    match args.first() {
        Some(file) if !file.starts_with('-') => Ok((file, &args[1..])),
        _ => bail!("'{command}' needs a FILE argument (try --help)"),
    }
}

fn parse_fields(args: &[String]) -> Result<Vec<FieldSpec>> {
    let mut fields = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--field" | "-f" => {
                let Some(value) = args.get(i + 1) else {
                    bail!("--field needs a value");
                };
                fields.push(FieldSpec::parse(value)?);
                i += 2;
            }
            other => bail!("unexpected argument '{other}'"),
        }
    }
    Ok(fields)
}

fn cmd_create(args: &[String]) -> Result<()> {
    let (file, rest) = split_file_arg(args, "create")?;
    let fields = parse_fields(rest)?;
    Database::create(file, &fields)?;
    Ok(())
}

fn cmd_insert(args: &[String]) -> Result<()> {
    let (file, rest) = split_file_arg(args, "insert")?;
    let mut records = Vec::new();
    if rest.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.wrap_err("failed to read stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(parse_record(&line)?);
        }
    } else {
        for arg in rest {
            records.push(parse_record(arg)?);
        }
    }
    ensure!(!records.is_empty(), "no records to insert");
    let db = Database::open(file)?;
    let offsets = db.insert(&records)?;
    eprintln!("inserted {} record(s)", offsets.len());
    Ok(())
}

fn parse_record(text: &str) -> Result<Json> {
    serde_json::from_str(text)
        .map_err(|err| JifyError::InvalidFormat(format!("bad record '{text}': {err}")).into())
}

fn cmd_index(args: &[String]) -> Result<()> {
    let (file, rest) = split_file_arg(args, "index")?;
    let fields = parse_fields(rest)?;
    ensure!(!fields.is_empty(), "'index' needs at least one --field");
    let db = Database::open(file)?;
    db.index(&fields)
}

fn cmd_find(args: &[String]) -> Result<()> {
    let (file, rest) = split_file_arg(args, "find")?;
    let mut queries: Vec<Query> = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--query" | "-q" => {
                let Some(text) = rest.get(i + 1) else {
                    bail!("--query needs a value");
                };
                queries.push(query::parse_query(text)?);
                i += 2;
            }
            other => bail!("unexpected argument '{other}'"),
        }
    }
    ensure!(!queries.is_empty(), "'find' needs at least one --query");
    let db = Database::open(file)?;
    for record in db.find(&queries)? {
        println!("{}", serde_json::to_string(&record?)?);
    }
    Ok(())
}

fn cmd_drop(args: &[String]) -> Result<()> {
    let (file, rest) = split_file_arg(args, "drop")?;
    ensure!(rest.is_empty(), "'drop' takes only a FILE argument");
    Database::open(file)?.destroy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fields_accepts_typed_names() {
        let args: Vec<String> = ["--field", "age", "--field", "born:date-time"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let fields = parse_fields(&args).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], FieldSpec::new("age"));
        assert_eq!(fields[1], FieldSpec::date_time("born"));
    }

    #[test]
    fn parse_fields_rejects_unknown_type() {
        let args: Vec<String> = ["--field", "age:integer"].iter().map(|s| s.to_string()).collect();
        assert!(parse_fields(&args).is_err());
    }

    #[test]
    fn unknown_command_errors() {
        assert!(run(&["frobnicate".to_string()]).is_err());
    }

    #[test]
    fn missing_file_argument_errors() {
        assert!(cmd_index(&["--field".to_string(), "age".to_string()]).is_err());
    }
}
