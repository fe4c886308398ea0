//! # jify CLI Entry Point
//!
//! ```bash
//! jify create db.json --field age
//! echo '{"name":"John","age":42}' | jify insert db.json
//! jify index db.json --field age
//! jify find db.json --query "age>=18,age<35"
//! ```
//!
//! Exit code 0 on success, 1 on any error. `DEBUG` non-empty enables
//! diagnostics on stderr.

use std::env;

use jify::cli;

fn main() {
    init_tracing();
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(err) = cli::run(&args) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let enabled = env::var_os("DEBUG").is_some_and(|value| !value.is_empty());
    if !enabled {
        return;
    }
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
